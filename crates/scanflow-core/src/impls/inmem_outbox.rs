//! In-memory outbox store. One FIFO list per category key.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::StoreError;
use crate::ports::{OutboxEntry, OutboxStore};

#[derive(Default)]
struct OutboxState {
    lists: HashMap<String, VecDeque<OutboxEntry>>,
    next_order: u64,
}

/// push / peek / ack は 1 つのロックの中で完結するので、並行 writer でも原子的
#[derive(Default)]
pub struct InMemoryOutbox {
    state: Mutex<OutboxState>,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a list, head first.
    pub async fn entries(&self, key: &str) -> Vec<OutboxEntry> {
        let state = self.state.lock().await;
        state
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutbox {
    async fn push(&self, key: &str, payload: String) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let order = state.next_order;
        state.next_order += 1;
        state
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(OutboxEntry {
                category_key: key.to_string(),
                payload,
                enqueued_order: order,
            });
        Ok(order)
    }

    async fn peek(&self, key: &str) -> Result<Option<OutboxEntry>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.lists.get(key).and_then(|list| list.front().cloned()))
    }

    async fn ack(&self, key: &str, enqueued_order: u64) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(list) = state.lists.get_mut(key) else {
            return Ok(false);
        };
        if list.front().map(|e| e.enqueued_order) == Some(enqueued_order) {
            list.pop_front();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn len(&self, key: &str) -> Result<usize, StoreError> {
        let state = self.state.lock().await;
        Ok(state.lists.get(key).map_or(0, VecDeque::len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn fifo_per_key() {
        let outbox = InMemoryOutbox::new();
        let first = outbox.push("outbox:a", "1".into()).await.unwrap();
        outbox.push("outbox:a", "2".into()).await.unwrap();
        outbox.push("outbox:b", "x".into()).await.unwrap();

        let head = outbox.peek("outbox:a").await.unwrap().unwrap();
        assert_eq!(head.payload, "1");
        assert_eq!(head.enqueued_order, first);
        assert_eq!(outbox.len("outbox:a").await.unwrap(), 2);
        assert_eq!(outbox.len("outbox:b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn ack_only_removes_the_matching_head() {
        let outbox = InMemoryOutbox::new();
        let first = outbox.push("k", "1".into()).await.unwrap();
        let second = outbox.push("k", "2".into()).await.unwrap();

        assert!(!outbox.ack("k", second).await.unwrap());
        assert!(outbox.ack("k", first).await.unwrap());
        assert!(!outbox.ack("k", first).await.unwrap());
        assert_eq!(outbox.peek("k").await.unwrap().unwrap().payload, "2");
        assert!(!outbox.ack("missing", 0).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_writers_get_unique_orders() {
        let outbox = Arc::new(InMemoryOutbox::new());
        let mut joins = Vec::new();
        for i in 0..32 {
            let outbox = Arc::clone(&outbox);
            joins.push(tokio::spawn(async move {
                outbox.push("k", i.to_string()).await.unwrap()
            }));
        }
        let mut orders = Vec::new();
        for join in joins {
            orders.push(join.await.unwrap());
        }
        orders.sort_unstable();
        orders.dedup();
        assert_eq!(orders.len(), 32);
        assert_eq!(outbox.len("k").await.unwrap(), 32);
    }
}
