//! Impls - 実装（開発用・テスト用）
//!
//! ports の in-memory 実装です。
//!
//! # 含まれる実装
//! - **InMemoryBroker**: DLX / TTL / 遅延配送つきのキュー
//! - **InMemoryEventBus**: blocking 受信の lifecycle event bus
//! - **InMemoryOutbox**: category key ごとの FIFO
//! - **InMemoryOwnershipStore / InMemoryGrantLedger**: 所有テーブルと台帳
//! - **StaticCatalog**: 固定の reward カタログ

pub mod inmem_broker;
pub mod inmem_events;
pub mod inmem_outbox;
pub mod inmem_ownership;
pub mod static_catalog;

pub use self::inmem_broker::InMemoryBroker;
pub use self::inmem_events::InMemoryEventBus;
pub use self::inmem_outbox::InMemoryOutbox;
pub use self::inmem_ownership::{InMemoryGrantLedger, InMemoryOwnershipStore};
pub use self::static_catalog::StaticCatalog;
