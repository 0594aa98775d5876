//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」です。
//! broker / event bus / outbox / ownership store / catalog / 下流 RPC など、
//! 外部システムへのインターフェースを trait として定義します。
//! 開発用の実装は `impls` にあります。

pub mod broker;
pub mod catalog;
pub mod clock;
pub mod event_bus;
pub mod grant_sink;
pub mod id_generator;
pub mod outbox_store;
pub mod ownership_store;
pub mod rpc;
pub mod stage_handler;

pub use self::broker::Broker;
pub use self::catalog::Catalog;
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_bus::{EventConsumer, EventPublisher, EventSource};
pub use self::grant_sink::GrantSink;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::outbox_store::{OutboxEntry, OutboxStore};
pub use self::ownership_store::OwnershipStore;
pub use self::rpc::{RewardRpc, RpcCode, RpcStatus, SyncRequest, SyncResponse};
pub use self::stage_handler::StageHandler;
