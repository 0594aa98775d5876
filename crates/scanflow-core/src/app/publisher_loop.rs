//! Outbox publisher and relay.
//!
//! # フロー
//! 1. `ReliablePublisher::publish` が broker へ直接 publish
//! 2. 失敗したら outbox の tail に積んで `QueuedToOutbox` を返す（呼び出し元には例外を返さない）
//! 3. `OutboxRelay` が head から peek → publish → ack の順で再送する
//!
//! # 配送保証
//! ack は publish 成功後なので at-least-once です。
//! publish と ack の間でプロセスが落ちると同じメッセージがもう一度送られます（consumer 側は冪等）。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::OutboxConfig;
use crate::domain::{BrokerError, Message, StoreError};
use crate::ports::{Broker, OutboxStore};

/// What sits in the outbox list, JSON-encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub routing_key: String,
    pub message: Message,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    QueuedToOutbox,
    /// Broker and outbox both failed. Logged at error level.
    Lost,
}

impl PublishOutcome {
    pub fn is_durable(self) -> bool {
        !matches!(self, PublishOutcome::Lost)
    }
}

pub struct ReliablePublisher {
    broker: Arc<dyn Broker>,
    outbox: Arc<dyn OutboxStore>,
    category_key: String,
}

impl ReliablePublisher {
    pub fn new(
        broker: Arc<dyn Broker>,
        outbox: Arc<dyn OutboxStore>,
        category_key: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            outbox,
            category_key: category_key.into(),
        }
    }

    pub async fn publish(&self, routing_key: &str, message: Message) -> PublishOutcome {
        let message_id = message.id;
        let record = OutboxRecord {
            routing_key: routing_key.to_string(),
            message,
        };
        let broker_error = match self.broker.publish(routing_key, record.message.clone()).await {
            Ok(()) => return PublishOutcome::Published,
            Err(e) => e,
        };

        warn!(
            queue = routing_key,
            message_id = %message_id,
            error = %broker_error,
            key = %self.category_key,
            "publish failed, queueing to outbox"
        );
        let payload = match serde_json::to_string(&record) {
            Ok(payload) => payload,
            Err(e) => {
                error!(queue = routing_key, message_id = %message_id, error = %e, "message lost: cannot encode outbox record");
                return PublishOutcome::Lost;
            }
        };
        match self.outbox.push(&self.category_key, payload).await {
            Ok(order) => {
                debug!(key = %self.category_key, order, "queued to outbox");
                PublishOutcome::QueuedToOutbox
            }
            Err(e) => {
                error!(queue = routing_key, message_id = %message_id, error = %e, "message lost: outbox unavailable");
                PublishOutcome::Lost
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub relayed: usize,
    /// Moved to the dead key.
    pub dead: usize,
    pub remaining: usize,
}

/// OutboxRelay は outbox を読んで broker に再送する
pub struct OutboxRelay {
    outbox: Arc<dyn OutboxStore>,
    broker: Arc<dyn Broker>,
    config: OutboxConfig,
    relayed_total: AtomicU64,
    dead_total: AtomicU64,
}

impl OutboxRelay {
    pub fn new(outbox: Arc<dyn OutboxStore>, broker: Arc<dyn Broker>, config: OutboxConfig) -> Self {
        Self {
            outbox,
            broker,
            config,
            relayed_total: AtomicU64::new(0),
            dead_total: AtomicU64::new(0),
        }
    }

    /// Relay up to `batch_size` entries from the head, in order.
    ///
    /// A broker failure stops the batch and leaves the entry at the head.
    pub async fn run_once(&self) -> Result<RelayStats, StoreError> {
        let key = self.config.category_key.as_str();
        let mut stats = RelayStats::default();

        for _ in 0..self.config.batch_size {
            let Some(entry) = self.outbox.peek(key).await? else {
                break;
            };

            let record: OutboxRecord = match serde_json::from_str(&entry.payload) {
                Ok(record) => record,
                Err(e) => {
                    warn!(key, order = entry.enqueued_order, error = %e, "unparsable outbox entry");
                    self.bury(&entry.payload, entry.enqueued_order).await?;
                    stats.dead += 1;
                    continue;
                }
            };

            match self
                .broker
                .publish(&record.routing_key, record.message)
                .await
            {
                Ok(()) => {
                    self.outbox.ack(key, entry.enqueued_order).await?;
                    stats.relayed += 1;
                }
                Err(BrokerError::UnknownQueue(queue)) => {
                    warn!(key, queue = %queue, "outbox entry targets an undeclared queue");
                    self.bury(&entry.payload, entry.enqueued_order).await?;
                    stats.dead += 1;
                }
                Err(e) => {
                    warn!(key, error = %e, "relay publish failed, will retry");
                    break;
                }
            }
        }

        stats.remaining = self.outbox.len(key).await?;
        self.relayed_total
            .fetch_add(stats.relayed as u64, Ordering::Relaxed);
        self.dead_total.fetch_add(stats.dead as u64, Ordering::Relaxed);
        if stats.relayed > 0 || stats.dead > 0 {
            info!(key, relayed = stats.relayed, dead = stats.dead, remaining = stats.remaining, "outbox relay pass");
        }
        Ok(stats)
    }

    /// Push to the dead key first, then drop the head.
    async fn bury(&self, payload: &str, order: u64) -> Result<(), StoreError> {
        self.outbox
            .push(&self.config.dead_key(), payload.to_string())
            .await?;
        self.outbox.ack(&self.config.category_key, order).await?;
        Ok(())
    }

    /// Poll until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(key = %self.config.category_key, "outbox relay started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
            if let Err(e) = self.run_once().await {
                error!(error = %e, "outbox relay pass failed");
            }
        }
        info!(
            relayed_total = self.relayed_total(),
            dead_total = self.dead_total(),
            "outbox relay stopped"
        );
    }

    pub fn relayed_total(&self) -> u64 {
        self.relayed_total.load(Ordering::Relaxed)
    }

    pub fn dead_total(&self) -> u64 {
        self.dead_total.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Chain, Topology};
    use crate::impls::{InMemoryBroker, InMemoryOutbox};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        broker: Arc<InMemoryBroker>,
        outbox: Arc<InMemoryOutbox>,
        publisher: ReliablePublisher,
        relay: OutboxRelay,
    }

    fn fixture() -> Fixture {
        let broker = Arc::new(InMemoryBroker::new(&Topology::standard(&Chain::standard())));
        let outbox = Arc::new(InMemoryOutbox::new());
        let config = OutboxConfig {
            poll_interval: Duration::from_millis(10),
            ..OutboxConfig::default()
        };
        Fixture {
            publisher: ReliablePublisher::new(broker.clone(), outbox.clone(), config.category_key.clone()),
            relay: OutboxRelay::new(outbox.clone(), broker.clone(), config),
            broker,
            outbox,
        }
    }

    const KEY: &str = "outbox:pipeline";

    #[tokio::test]
    async fn direct_publish_skips_the_outbox() {
        let f = fixture();
        let outcome = f.publisher.publish("scan.vision", Message::new(json!(1))).await;
        assert_eq!(outcome, PublishOutcome::Published);
        assert_eq!(f.broker.messages("scan.vision").await.len(), 1);
        assert_eq!(f.outbox.len(KEY).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn broker_failure_is_observable_in_the_outbox() {
        let f = fixture();
        f.broker.set_publish_down(true);

        let outcome = f.publisher.publish("scan.vision", Message::new(json!(1))).await;
        assert_eq!(outcome, PublishOutcome::QueuedToOutbox);
        assert!(f.broker.messages("scan.vision").await.is_empty());

        let entries = f.outbox.entries(KEY).await;
        assert_eq!(entries.len(), 1);
        let record: OutboxRecord = serde_json::from_str(&entries[0].payload).unwrap();
        assert_eq!(record.routing_key, "scan.vision");
    }

    struct BrokenOutbox;

    #[async_trait]
    impl OutboxStore for BrokenOutbox {
        async fn push(&self, _key: &str, _payload: String) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("disk full".into()))
        }
        async fn peek(&self, _key: &str) -> Result<Option<crate::ports::OutboxEntry>, StoreError> {
            Ok(None)
        }
        async fn ack(&self, _key: &str, _order: u64) -> Result<bool, StoreError> {
            Ok(false)
        }
        async fn len(&self, _key: &str) -> Result<usize, StoreError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn both_paths_failing_is_reported_as_lost() {
        let broker = Arc::new(InMemoryBroker::new(&Topology::standard(&Chain::standard())));
        broker.set_publish_down(true);
        let publisher = ReliablePublisher::new(broker, Arc::new(BrokenOutbox), KEY);
        let outcome = publisher.publish("scan.vision", Message::new(json!(1))).await;
        assert_eq!(outcome, PublishOutcome::Lost);
        assert!(!outcome.is_durable());
    }

    #[tokio::test]
    async fn relay_preserves_order() {
        let f = fixture();
        f.broker.set_publish_down(true);
        for n in 0..3 {
            f.publisher.publish("scan.rule", Message::new(json!(n))).await;
        }
        f.broker.set_publish_down(false);

        let stats = f.relay.run_once().await.unwrap();
        assert_eq!(stats, RelayStats { relayed: 3, dead: 0, remaining: 0 });

        let bodies: Vec<_> = f
            .broker
            .messages("scan.rule")
            .await
            .into_iter()
            .map(|m| m.body)
            .collect();
        assert_eq!(bodies, vec![json!(0), json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn relay_failure_keeps_the_entry_at_the_head() {
        let f = fixture();
        f.broker.set_publish_down(true);
        f.publisher.publish("scan.rule", Message::new(json!("a"))).await;
        f.publisher.publish("scan.rule", Message::new(json!("b"))).await;
        f.broker.set_publish_down(false);

        f.broker.fail_next_publishes(1);
        let stats = f.relay.run_once().await.unwrap();
        assert_eq!(stats, RelayStats { relayed: 0, dead: 0, remaining: 2 });

        let stats = f.relay.run_once().await.unwrap();
        assert_eq!(stats.relayed, 2);
        assert_eq!(f.broker.messages("scan.rule").await[0].body, json!("a"));
        assert_eq!(f.relay.relayed_total(), 2);
    }

    #[tokio::test]
    async fn unparsable_entries_move_to_the_dead_key() {
        let f = fixture();
        f.outbox.push(KEY, "{not json".into()).await.unwrap();
        f.broker.set_publish_down(true);
        f.publisher.publish("scan.answer", Message::new(json!(1))).await;
        f.broker.set_publish_down(false);

        let stats = f.relay.run_once().await.unwrap();
        assert_eq!(stats, RelayStats { relayed: 1, dead: 1, remaining: 0 });
        assert_eq!(f.outbox.entries("outbox:pipeline:dlq").await[0].payload, "{not json");
        assert_eq!(f.relay.dead_total(), 1);
    }

    #[tokio::test]
    async fn batch_size_bounds_one_pass() {
        let f = fixture();
        f.broker.set_publish_down(true);
        for n in 0..12 {
            f.publisher.publish("scan.vision", Message::new(json!(n))).await;
        }
        f.broker.set_publish_down(false);

        let stats = f.relay.run_once().await.unwrap();
        assert_eq!(stats.relayed, 10);
        assert_eq!(stats.remaining, 2);
    }

    #[tokio::test]
    async fn run_loop_relays_until_shutdown() {
        let f = Arc::new(fixture());
        f.broker.set_publish_down(true);
        f.publisher.publish("scan.vision", Message::new(json!(1))).await;
        f.broker.set_publish_down(false);

        let (tx, rx) = watch::channel(false);
        let handle = {
            let f = Arc::clone(&f);
            tokio::spawn(async move { f.relay.run(rx).await })
        };
        for _ in 0..100 {
            if f.outbox.len(KEY).await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(f.outbox.len(KEY).await.unwrap(), 0);
        assert_eq!(f.broker.messages("scan.vision").await.len(), 1);
    }
}
