use async_trait::async_trait;

use crate::domain::{CatalogItem, StoreError};
use crate::ports::Catalog;

/// Fixed catalog, kept in the order it was given.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    items: Vec<CatalogItem>,
}

impl StaticCatalog {
    pub fn new(items: Vec<CatalogItem>) -> Self {
        Self { items }
    }
}

#[async_trait]
impl Catalog for StaticCatalog {
    async fn items(&self) -> Result<Vec<CatalogItem>, StoreError> {
        Ok(self.items.clone())
    }
}
