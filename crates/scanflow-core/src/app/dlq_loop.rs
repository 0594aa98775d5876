//! DlqReprocessor - dead-letter queue の定期回収
//!
//! # フロー
//! 1. `dlq.<queue>` から最大 `batch_size` 件を basic_get
//! 2. 現在の `x-dlq-retry-count` がしきい値未満なら元 queue へ、以上なら `archive.<queue>` へ
//!    （どちらも count を +1 して publish）
//! 3. publish 成功後に ack
//! 4. publish に失敗したものはバッチの最後にまとめて requeue し、次回に回す

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::DlqConfig;
use crate::domain::message::{
    ATTEMPT_HEADER, DEATH_REASON_HEADER, DLQ_RETRY_HEADER, FIRST_DEATH_QUEUE_HEADER,
};
use crate::domain::{DlqRoute, Message};
use crate::ports::Broker;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReprocessStats {
    pub processed: usize,
    pub retried: usize,
    pub archived: usize,
    pub errors: usize,
}

impl std::ops::AddAssign for ReprocessStats {
    fn add_assign(&mut self, other: Self) {
        self.processed += other.processed;
        self.retried += other.retried;
        self.archived += other.archived;
        self.errors += other.errors;
    }
}

pub struct DlqReprocessor {
    broker: Arc<dyn Broker>,
    routes: Vec<DlqRoute>,
    config: DlqConfig,
}

impl DlqReprocessor {
    pub fn new(broker: Arc<dyn Broker>, routes: Vec<DlqRoute>, config: DlqConfig) -> Self {
        Self {
            broker,
            routes,
            config,
        }
    }

    pub fn routes(&self) -> &[DlqRoute] {
        &self.routes
    }

    pub async fn reprocess(&self, route: &DlqRoute) -> ReprocessStats {
        let mut stats = ReprocessStats::default();
        // requeue は最後に行う。途中で戻すと同じメッセージを再取得してしまう
        let mut failed = Vec::new();
        for _ in 0..self.config.batch_size {
            let delivery = match self.broker.get(&route.dead_letter_queue).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => break,
                Err(e) => {
                    warn!(queue = %route.dead_letter_queue, error = %e, "dlq fetch failed");
                    stats.errors += 1;
                    break;
                }
            };
            stats.processed += 1;

            let current = delivery.message.header_u32(DLQ_RETRY_HEADER);
            let archive = current >= self.config.archive_threshold;
            let retry_count = current + 1;
            let (target, message) = if archive {
                (&route.archive_queue, delivery.message.clone().with_header(DLQ_RETRY_HEADER, retry_count))
            } else {
                (&route.origin_queue, fresh_copy(delivery.message.clone(), retry_count))
            };

            match self.broker.publish(target, message).await {
                Ok(()) => {
                    if let Err(e) = self.broker.ack(delivery.tag).await {
                        warn!(queue = %route.dead_letter_queue, error = %e, "dlq ack failed");
                    }
                    if archive {
                        warn!(queue = %route.origin_queue, message_id = %delivery.message.id, retry_count, "archived after repeated failures");
                        stats.archived += 1;
                    } else {
                        debug!(queue = %route.origin_queue, message_id = %delivery.message.id, retry_count, "republished from dlq");
                        stats.retried += 1;
                    }
                }
                Err(e) => {
                    error!(queue = %target, message_id = %delivery.message.id, error = %e, "dlq republish failed, requeueing");
                    stats.errors += 1;
                    failed.push(delivery.tag);
                }
            }
        }
        for tag in failed {
            if let Err(e) = self.broker.nack(tag, true).await {
                warn!(queue = %route.dead_letter_queue, error = %e, "dlq requeue failed");
            }
        }
        stats
    }

    /// Sweep every route once.
    pub async fn run_once(&self) -> ReprocessStats {
        let mut total = ReprocessStats::default();
        for route in &self.routes {
            total += self.reprocess(route).await;
        }
        if total.processed > 0 {
            info!(
                processed = total.processed,
                retried = total.retried,
                archived = total.archived,
                errors = total.errors,
                "dlq sweep"
            );
        }
        total
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // 最初の tick は即時なので読み捨てる
        interval.tick().await;
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
                _ = interval.tick() => {}
            }
            self.run_once().await;
        }
        info!("dlq reprocessor stopped");
    }
}

/// Origin copy: the stage starts over from its first attempt.
fn fresh_copy(message: Message, retry_count: u32) -> Message {
    let mut message = message
        .without_header(ATTEMPT_HEADER)
        .without_header(DEATH_REASON_HEADER)
        .without_header(FIRST_DEATH_QUEUE_HEADER)
        .with_header(DLQ_RETRY_HEADER, retry_count);
    message.delay_ms = None;
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Chain, Topology};
    use crate::impls::InMemoryBroker;
    use serde_json::json;
    use std::time::Duration;

    fn setup() -> (Arc<InMemoryBroker>, DlqReprocessor, DlqRoute) {
        let topology = Topology::standard(&Chain::standard());
        let broker = Arc::new(InMemoryBroker::new(&topology));
        let route = DlqRoute::for_queue("scan.rule");
        let reprocessor = DlqReprocessor::new(broker.clone(), topology.dlq_routes(), DlqConfig::default());
        (broker, reprocessor, route)
    }

    async fn dead_letter(broker: &InMemoryBroker, body: serde_json::Value, retry_count: u32) {
        let message = Message::new(body)
            .with_header(ATTEMPT_HEADER, 3)
            .with_header(DLQ_RETRY_HEADER, retry_count);
        broker.publish("scan.rule", message).await.unwrap();
        let delivery = broker.get("scan.rule").await.unwrap().unwrap();
        broker.nack(delivery.tag, false).await.unwrap();
    }

    #[tokio::test]
    async fn below_threshold_goes_back_to_origin() {
        let (broker, reprocessor, route) = setup();
        dead_letter(&broker, json!("a"), 0).await;

        let stats = reprocessor.reprocess(&route).await;
        assert_eq!(stats, ReprocessStats { processed: 1, retried: 1, archived: 0, errors: 0 });

        let back = broker.messages("scan.rule").await;
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].header_u32(DLQ_RETRY_HEADER), 1);
        assert_eq!(back[0].attempt(), 0);
        assert!(!back[0].headers.contains_key(DEATH_REASON_HEADER));
        assert!(broker.messages("dlq.scan.rule").await.is_empty());
    }

    #[tokio::test]
    async fn last_retry_below_threshold_is_still_republished() {
        let (broker, reprocessor, route) = setup();
        dead_letter(&broker, json!("late"), 2).await;

        let stats = reprocessor.reprocess(&route).await;
        assert_eq!(stats, ReprocessStats { processed: 1, retried: 1, archived: 0, errors: 0 });
        let back = broker.messages("scan.rule").await;
        assert_eq!(back[0].header_u32(DLQ_RETRY_HEADER), 3);
        assert!(broker.messages("archive.scan.rule").await.is_empty());
    }

    #[tokio::test]
    async fn threshold_reached_goes_to_archive() {
        let (broker, reprocessor, route) = setup();
        dead_letter(&broker, json!("old"), 3).await;

        let stats = reprocessor.reprocess(&route).await;
        assert_eq!(stats.archived, 1);
        let archived = broker.messages("archive.scan.rule").await;
        assert_eq!(archived[0].header_u32(DLQ_RETRY_HEADER), 4);
        assert!(broker.messages("scan.rule").await.is_empty());
    }

    #[tokio::test]
    async fn failed_publish_keeps_the_message_in_the_dlq() {
        let (broker, reprocessor, route) = setup();
        dead_letter(&broker, json!("a"), 0).await;
        broker.fail_next_publishes(1);

        let stats = reprocessor.reprocess(&route).await;
        assert_eq!(stats, ReprocessStats { processed: 1, retried: 0, archived: 0, errors: 1 });
        assert_eq!(broker.messages("dlq.scan.rule").await.len(), 1);
        assert_eq!(broker.stats("dlq.scan.rule").await.unacked, 0);
    }

    #[tokio::test]
    async fn one_failed_publish_does_not_stop_the_batch() {
        let (broker, reprocessor, route) = setup();
        for n in 0..3 {
            dead_letter(&broker, json!(n), 0).await;
        }
        broker.fail_next_publishes(1);

        let stats = reprocessor.reprocess(&route).await;
        assert_eq!(stats, ReprocessStats { processed: 3, retried: 2, archived: 0, errors: 1 });
        assert_eq!(broker.messages("scan.rule").await.len(), 2);
        assert_eq!(broker.messages("dlq.scan.rule").await.len(), 1);
        assert_eq!(broker.stats("dlq.scan.rule").await.unacked, 0);
    }

    #[tokio::test]
    async fn batch_size_bounds_a_pass() {
        let (broker, reprocessor, route) = setup();
        for n in 0..12 {
            dead_letter(&broker, json!(n), 0).await;
        }
        assert_eq!(reprocessor.reprocess(&route).await.processed, 10);
        assert_eq!(broker.messages("dlq.scan.rule").await.len(), 2);
    }

    #[tokio::test]
    async fn run_once_sweeps_every_route() {
        let (broker, reprocessor, _) = setup();
        dead_letter(&broker, json!(1), 0).await;
        let message = Message::new(json!("grant"));
        broker.publish("my.sync", message).await.unwrap();
        let delivery = broker.get("my.sync").await.unwrap().unwrap();
        broker.nack(delivery.tag, false).await.unwrap();

        assert_eq!(reprocessor.routes().len(), 6);
        let stats = reprocessor.run_once().await;
        assert_eq!(stats.retried, 2);
        assert_eq!(broker.messages("my.sync").await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_sweeps_on_the_interval() {
        let (broker, reprocessor, _) = setup();
        let reprocessor = Arc::new(reprocessor);
        dead_letter(&broker, json!(1), 0).await;

        let (tx, rx) = watch::channel(false);
        let handle = {
            let r = Arc::clone(&reprocessor);
            tokio::spawn(async move { r.run(rx).await })
        };
        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(broker.messages("scan.rule").await.len(), 1);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
