//! Reward - 評価・付与・永続化
//!
//! # 主要コンポーネント
//! - **RewardEvaluator / EvaluatorRegistry**: source ごとの評価戦略
//! - **RewardDispatcher**: grant の確定と永続化 fan-out
//! - **RewardStage**: チェーン最終ステージの handler
//! - **PersistExecutor**: `reward.persist` / `my.sync` の consumer

pub mod dispatcher;
pub mod evaluator;
pub mod persist;
pub mod stage;

pub use self::dispatcher::{DispatchReceipt, RewardDispatcher};
pub use self::evaluator::{EvaluatorRegistry, RewardEvaluator, ScanRewardEvaluator};
pub use self::persist::{CollectionSyncSink, PersistExecutor};
pub use self::stage::{RewardStage, classification_result, reward_request};
