//! Outbox store port - publish 失敗時の退避先
//!
//! push は tail、読み出しは head から（FIFO）。
//! 読み出しは peek → publish → ack の 2 段階で、publish 成功前に消えることはありません。

use async_trait::async_trait;

use crate::domain::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    pub category_key: String,
    pub payload: String,
    /// Monotonic per store; identifies the entry for `ack`.
    pub enqueued_order: u64,
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Tail-append. Returns the entry's `enqueued_order`.
    async fn push(&self, key: &str, payload: String) -> Result<u64, StoreError>;

    /// Head entry without removing it.
    async fn peek(&self, key: &str) -> Result<Option<OutboxEntry>, StoreError>;

    /// Remove the head iff it is still `enqueued_order`. Returns whether it was removed.
    async fn ack(&self, key: &str, enqueued_order: u64) -> Result<bool, StoreError>;

    async fn len(&self, key: &str) -> Result<usize, StoreError>;
}
