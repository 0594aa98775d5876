//! In-memory ownership table and ownership ledger.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{Grant, OwnerId, PersistTarget, StoreError};
use crate::ports::{GrantSink, OwnershipStore};

/// Unique on (owner, item_code). `find` and `insert` take the lock separately,
/// so two callers can both miss on `find` and race on `insert`, as with a real table.
#[derive(Default)]
pub struct InMemoryOwnershipStore {
    rows: Mutex<HashMap<(OwnerId, String), Grant>>,
}

impl InMemoryOwnershipStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.rows.lock().await.len()
    }
}

#[async_trait]
impl OwnershipStore for InMemoryOwnershipStore {
    async fn find(&self, owner: OwnerId, item_code: &str) -> Result<Option<Grant>, StoreError> {
        let rows = self.rows.lock().await;
        Ok(rows.get(&(owner, item_code.to_string())).cloned())
    }

    async fn insert(&self, grant: Grant) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().await;
        let key = (grant.owner_id, grant.item_code.clone());
        if rows.contains_key(&key) {
            return Err(StoreError::UniqueViolation {
                owner: grant.owner_id,
                item: grant.item_code,
            });
        }
        rows.insert(key, grant);
        Ok(())
    }
}

/// Ownership ledger keyed by `Grant::key`. Upserts, so replays are harmless.
#[derive(Default)]
pub struct InMemoryGrantLedger {
    rows: Mutex<HashMap<String, Grant>>,
    writes: AtomicUsize,
}

impl InMemoryGrantLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, grant: &Grant) -> bool {
        self.rows.lock().await.contains_key(&grant.key())
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    /// Total persist calls, including replays.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GrantSink for InMemoryGrantLedger {
    fn target(&self) -> PersistTarget {
        PersistTarget::Ownership
    }

    async fn persist(&self, grant: &Grant) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.rows.lock().await.insert(grant.key(), grant.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ulid::Ulid;

    fn grant(owner: OwnerId) -> Grant {
        Grant {
            owner_id: owner,
            item_code: "char-pet".into(),
            item_name: "Petty".into(),
            source_label: "scan-reward".into(),
            granted_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn second_insert_violates_uniqueness() {
        let store = InMemoryOwnershipStore::new();
        let owner = OwnerId::from_ulid(Ulid::new());

        store.insert(grant(owner)).await.unwrap();
        let err = store.insert(grant(owner)).await.unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation { .. }));
        assert_eq!(store.count().await, 1);
        assert!(store.find(owner, "char-pet").await.unwrap().is_some());
        assert!(store.find(owner, "char-other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ledger_upserts() {
        let ledger = InMemoryGrantLedger::new();
        let g = grant(OwnerId::from_ulid(Ulid::new()));
        ledger.persist(&g).await.unwrap();
        ledger.persist(&g).await.unwrap();
        assert_eq!(ledger.len().await, 1);
        assert_eq!(ledger.writes(), 2);
        assert!(ledger.contains(&g).await);
    }
}
