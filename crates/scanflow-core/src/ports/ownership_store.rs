use async_trait::async_trait;

use crate::domain::{Grant, OwnerId, StoreError};

/// Authoritative ownership table, unique on (owner, item_code).
#[async_trait]
pub trait OwnershipStore: Send + Sync {
    async fn find(&self, owner: OwnerId, item_code: &str) -> Result<Option<Grant>, StoreError>;

    /// Fails with `StoreError::UniqueViolation` when the pair already exists.
    async fn insert(&self, grant: Grant) -> Result<(), StoreError>;
}
