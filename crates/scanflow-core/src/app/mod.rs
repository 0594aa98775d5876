//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてパイプラインの振る舞いを実装します。
//!
//! # 主要コンポーネント
//! - **PipelineBuilder / Pipeline**: ハンドラ登録、run の投入、worker の起動
//! - **StageExecutor**: 1 stage 分の実行（timeout、retry 判定、次 stage への hand-off）
//! - **WorkerGroup**: キューごとの consume ループ（ack / retry / dead-letter）
//! - **ReliablePublisher / OutboxRelay**: broker 障害時の outbox 退避と再送
//! - **DlqReprocessor**: dead-letter キューの再投入とアーカイブ
//! - **reward**: 報酬判定、所有権の付与、永続化の fan-out
//! - **bridge**: lifecycle event から SSE progress stream への変換
//! - **resilience**: retry policy、circuit breaker、RPC client

pub mod bridge;
pub mod builder;
pub mod dlq_loop;
pub mod executor;
pub mod publisher_loop;
pub mod resilience;
pub mod reward;
pub mod worker_loop;

#[cfg(test)]
pub(crate) mod testing;

// 主要な型を再エクスポート
pub use self::bridge::{BridgeState, Frame, ProgressBridge, ProgressStream};
pub use self::builder::{Pipeline, PipelineBuilder, ScanInput, Services};
pub use self::dlq_loop::{DlqReprocessor, ReprocessStats};
pub use self::executor::StageExecutor;
pub use self::publisher_loop::{OutboxRelay, PublishOutcome, RelayStats, ReliablePublisher};
pub use self::resilience::{CircuitBreaker, ResilientRewardClient, RetryPolicy};
pub use self::worker_loop::{DeliveryHandler, Disposition, WorkerGroup};
