use async_trait::async_trait;

use crate::domain::{CatalogItem, StoreError};

/// Reward catalog. Items come back in priority order.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn items(&self) -> Result<Vec<CatalogItem>, StoreError>;
}
