//! Errors - エラー型と分類
//!
//! 失敗ドメインごとに enum を分けています。
//! - ステージ実行: `StageError`（Transient → retry, Permanent → dead-letter）
//! - コンテキスト合成: `ContextError`
//! - broker / store: `BrokerError`, `StoreError`
//! - progress bridge: `BridgeError`
//! - 構築・投入: `BuildError`, `SubmitError`

use thiserror::Error;

use super::ids::{OwnerId, TaskId};
use super::stage::StageId;

/// ErrorKind は実行エラーの運用分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 一時的なエラー（リトライ推奨）
    Transient,
    /// 恒久的なエラー（リトライ無意味）
    Permanent,
}

/// Failure raised by a stage handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    #[error("transient stage failure: {0}")]
    Transient(String),
    #[error("permanent stage failure: {0}")]
    Permanent(String),
}

impl StageError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::Transient,
            Self::Permanent(_) => ErrorKind::Permanent,
        }
    }
}

/// Violations of the run context merge rules.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ContextError {
    #[error("stage {stage} tried to overwrite key {key:?}")]
    KeyConflict { stage: StageId, key: String },

    #[error("stage {stage} used reserved key {key:?}")]
    ReservedKey { stage: StageId, key: String },

    #[error("duration_total_ms {total} does not match stage sum {sum}")]
    DurationMismatch { total: f64, sum: f64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("queue {0:?} is not declared")]
    UnknownQueue(String),

    #[error("delivery tag {0} is not outstanding")]
    UnknownDelivery(u64),

    #[error("message encoding failed: {0}")]
    Encoding(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// (owner, item) uniqueness constraint fired.
    #[error("{owner} already owns {item}")]
    UniqueViolation { owner: OwnerId, item: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt entry: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// Event claims the run but its stage cannot be resolved. Non-fatal.
    #[error("correlation lost for {task_id}: {reason}")]
    CorrelationLost { task_id: TaskId, reason: String },

    #[error("event listener failed: {0}")]
    ListenerFailed(String),

    #[error("listener not ready within {0:?}")]
    NotReady(std::time::Duration),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Broker and outbox both refused the first stage message.
    #[error("run could not be enqueued: {0}")]
    NotEnqueued(String),
}

/// BuildError はパイプライン構築時のエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("Handler for stage {0} is already registered")]
    DuplicateHandler(StageId),

    #[error("Missing stage handlers: {0:?}. These stages are part of the chain but not registered.")]
    MissingStages(Vec<StageId>),
}
