use async_trait::async_trait;

use crate::domain::{Grant, PersistTarget, StoreError};

/// A downstream store that receives new grants asynchronously.
///
/// `persist` must be idempotent: the same grant can arrive more than once.
#[async_trait]
pub trait GrantSink: Send + Sync {
    fn target(&self) -> PersistTarget;

    async fn persist(&self, grant: &Grant) -> Result<(), StoreError>;
}
