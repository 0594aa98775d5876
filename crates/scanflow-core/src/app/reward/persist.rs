//! Background persistence of new grants.
//!
//! `reward.persist`（所有台帳）と `my.sync`（コレクション同期）はそれぞれ独立した
//! queue / worker group で処理されます。失敗は指数 backoff + jitter で retry し、
//! 上限を超えたら DLQ に送ります。

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::app::resilience::{ResilientRewardClient, RetryPolicy};
use crate::app::worker_loop::{DeliveryHandler, Disposition};
use crate::config::RewardConfig;
use crate::domain::{Delivery, Grant, PersistMessage, PersistTarget, StoreError};
use crate::ports::{GrantSink, SyncRequest};

pub struct PersistExecutor {
    sink: Arc<dyn GrantSink>,
    retry: RetryPolicy,
    max_retries: u32,
}

impl PersistExecutor {
    pub fn new(sink: Arc<dyn GrantSink>, config: &RewardConfig) -> Self {
        Self {
            sink,
            retry: RetryPolicy::exponential(config.persist_base_delay, config.persist_max_delay),
            max_retries: config.persist_max_retries,
        }
    }

    pub fn target(&self) -> PersistTarget {
        self.sink.target()
    }

    pub fn queue(&self) -> &'static str {
        self.sink.target().queue()
    }

    pub async fn execute(&self, grant: &Grant, attempt: u32) -> Disposition {
        let target = self.sink.target();
        match self.sink.persist(grant).await {
            Ok(()) => {
                debug!(%target, key = %grant.key(), attempt, "grant persisted");
                Disposition::Ack
            }
            // 既に書かれている = 目的は達成済み
            Err(StoreError::UniqueViolation { .. }) => Disposition::Ack,
            Err(StoreError::Corrupt(reason)) => {
                error!(%target, key = %grant.key(), %reason, "grant rejected by store");
                Disposition::DeadLetter(reason)
            }
            Err(e) if attempt < self.max_retries => {
                let delay = self.retry.next_delay(attempt);
                warn!(%target, key = %grant.key(), attempt, delay_ms = delay.as_millis() as u64, error = %e, "persist failed, retrying");
                Disposition::RetryLater { delay }
            }
            Err(e) => {
                error!(%target, key = %grant.key(), attempt, error = %e, "persist retries exhausted");
                Disposition::DeadLetter(e.to_string())
            }
        }
    }
}

#[async_trait]
impl DeliveryHandler for PersistExecutor {
    async fn handle(&self, delivery: &Delivery) -> Disposition {
        let message: PersistMessage = match delivery.message.decode() {
            Ok(message) => message,
            Err(e) => {
                error!(queue = %delivery.queue, error = %e, "undecodable persist message");
                return Disposition::DeadLetter(format!("undecodable persist message: {e}"));
            }
        };
        if message.target != self.sink.target() {
            return Disposition::DeadLetter(format!("{} message on {}", message.target, delivery.queue));
        }
        self.execute(&message.grant, delivery.message.attempt()).await
    }
}

/// Pushes grants into the user's collection through the resilient RPC client.
pub struct CollectionSyncSink {
    client: Arc<ResilientRewardClient>,
}

impl CollectionSyncSink {
    pub fn new(client: Arc<ResilientRewardClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl GrantSink for CollectionSyncSink {
    fn target(&self) -> PersistTarget {
        PersistTarget::Collection
    }

    async fn persist(&self, grant: &Grant) -> Result<(), StoreError> {
        let request = SyncRequest {
            owner_id: grant.owner_id,
            item_code: grant.item_code.clone(),
            item_name: grant.item_name.clone(),
            source: grant.source_label.clone(),
        };
        let result = self.client.sync_grant(&request).await;
        if result.success || result.already_owned {
            Ok(())
        } else {
            Err(StoreError::Unavailable("collection sync returned a negative result".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::resilience::rpc_client::testing::ScriptedRpc;
    use crate::config::RpcClientConfig;
    use crate::domain::OwnerId;
    use crate::impls::InMemoryGrantLedger;
    use crate::ports::RpcCode;
    use chrono::Utc;
    use std::time::Duration;
    use ulid::Ulid;

    fn grant() -> Grant {
        Grant {
            owner_id: OwnerId::from_ulid(Ulid::new()),
            item_code: "plabot".into(),
            item_name: "Plabot".into(),
            source_label: "scan-reward".into(),
            granted_at: Utc::now(),
        }
    }

    struct FlakySink {
        error: StoreError,
    }

    #[async_trait]
    impl GrantSink for FlakySink {
        fn target(&self) -> PersistTarget {
            PersistTarget::Ownership
        }
        async fn persist(&self, _grant: &Grant) -> Result<(), StoreError> {
            Err(self.error.clone())
        }
    }

    #[tokio::test]
    async fn ledger_persist_is_idempotent() {
        let ledger = Arc::new(InMemoryGrantLedger::new());
        let executor = PersistExecutor::new(ledger.clone(), &RewardConfig::default());
        let grant = grant();

        assert_eq!(executor.execute(&grant, 0).await, Disposition::Ack);
        assert_eq!(executor.execute(&grant, 0).await, Disposition::Ack);
        assert_eq!(ledger.len().await, 1);
        assert_eq!(ledger.writes(), 2);
        assert_eq!(executor.queue(), "reward.persist");
    }

    #[tokio::test]
    async fn unavailable_store_backs_off_then_dead_letters() {
        let executor = PersistExecutor::new(
            Arc::new(FlakySink {
                error: StoreError::Unavailable("db down".into()),
            }),
            &RewardConfig::default(),
        );
        let grant = grant();

        let mut delays = Vec::new();
        for attempt in 0..5 {
            match executor.execute(&grant, attempt).await {
                Disposition::RetryLater { delay } => delays.push(delay),
                other => panic!("attempt {attempt}: unexpected {other:?}"),
            }
        }
        // base 1s, ±25% jitter
        assert!(delays[0] >= Duration::from_millis(750) && delays[0] <= Duration::from_millis(1250));
        assert!(delays[4] >= Duration::from_secs(12) && delays[4] <= Duration::from_secs(20));

        assert!(matches!(executor.execute(&grant, 5).await, Disposition::DeadLetter(_)));
    }

    #[tokio::test]
    async fn corrupt_grants_are_not_retried() {
        let executor = PersistExecutor::new(
            Arc::new(FlakySink {
                error: StoreError::Corrupt("bad code".into()),
            }),
            &RewardConfig::default(),
        );
        assert_eq!(
            executor.execute(&grant(), 0).await,
            Disposition::DeadLetter("bad code".into())
        );
    }

    fn sync_sink(rpc: ScriptedRpc) -> CollectionSyncSink {
        let config = RpcClientConfig {
            max_retries: 0,
            ..RpcClientConfig::default()
        };
        CollectionSyncSink::new(Arc::new(ResilientRewardClient::new(Arc::new(rpc), &config)))
    }

    #[tokio::test]
    async fn collection_sync_accepts_already_owned() {
        let sink = sync_sink(ScriptedRpc::new(vec![Ok(crate::ports::SyncResponse {
            success: false,
            already_owned: true,
        })]));
        assert!(sink.persist(&grant()).await.is_ok());
    }

    #[tokio::test]
    async fn negative_sync_result_is_retryable() {
        let sink = sync_sink(ScriptedRpc::failing(RpcCode::Unavailable, 1));
        let executor = PersistExecutor::new(Arc::new(sink), &RewardConfig::default());
        assert_eq!(executor.target(), PersistTarget::Collection);
        assert!(matches!(
            executor.execute(&grant(), 0).await,
            Disposition::RetryLater { .. }
        ));
        // script exhausted, downstream answers again
        assert_eq!(executor.execute(&grant(), 1).await, Disposition::Ack);
    }
}
