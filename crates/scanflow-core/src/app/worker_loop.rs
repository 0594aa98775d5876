//! WorkerGroup - queue を consume して handler の判定を broker に反映する
//!
//! # フロー
//! 1. `Broker::consume` で delivery を待つ（shutdown と select で競合させる）
//! 2. `DeliveryHandler::handle` が [`Disposition`] を返す
//! 3. Ack / 遅延つき再 publish / dead-letter を broker に反映
//!
//! shutdown は新しい delivery の取得を止めるだけで、実行中の handler は最後まで走ります。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::message::ATTEMPT_HEADER;
use crate::domain::{Delivery, Message};
use crate::ports::Broker;

/// What the worker should do with a delivery once the handler is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Publish a copy with `x-attempt + 1` after `delay`, then ack the original.
    RetryLater { delay: Duration },
    /// Reject without requeue so the queue's dead-letter binding takes it.
    DeadLetter(String),
}

#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Disposition;
}

/// Worker group handle.
/// - `request_shutdown()` で全ワーカーが新規取得を止める
/// - `shutdown_and_join()` で全ワーカーの終了を待てる
pub struct WorkerGroup {
    name: String,
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `n` workers consuming `queue`.
    pub fn spawn(
        name: impl Into<String>,
        n: usize,
        queue: impl Into<String>,
        broker: Arc<dyn Broker>,
        handler: Arc<dyn DeliveryHandler>,
        consume_wait: Duration,
    ) -> Self {
        let name = name.into();
        let queue = queue.into();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let joins = (0..n)
            .map(|worker_id| {
                let worker = Worker {
                    label: format!("{name}-{worker_id}"),
                    queue: queue.clone(),
                    broker: Arc::clone(&broker),
                    handler: Arc::clone(&handler),
                    consume_wait,
                };
                let mut rx = shutdown_rx.clone();
                tokio::spawn(async move { worker.run(&mut rx).await })
            })
            .collect();

        info!(group = %name, queue = %queue, workers = n, "worker group started");
        Self {
            name,
            shutdown_tx,
            joins,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(e) = join.await {
                warn!(group = %self.name, error = %e, "worker task panicked");
            }
        }
        info!(group = %self.name, "worker group stopped");
    }
}

struct Worker {
    label: String,
    queue: String,
    broker: Arc<dyn Broker>,
    handler: Arc<dyn DeliveryHandler>,
    consume_wait: Duration,
}

impl Worker {
    async fn run(&self, shutdown_rx: &mut watch::Receiver<bool>) {
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let delivery = tokio::select! {
                changed = shutdown_rx.changed() => {
                    // sender gone = group handle dropped
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                delivery = self.broker.consume(&self.queue, self.consume_wait) => delivery,
            };

            let delivery = match delivery {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(e) => {
                    warn!(worker = %self.label, queue = %self.queue, error = %e, "consume failed");
                    tokio::time::sleep(self.consume_wait).await;
                    continue;
                }
            };

            let disposition = self.handler.handle(&delivery).await;
            self.settle(delivery, disposition).await;
        }
        debug!(worker = %self.label, "worker stopped");
    }

    async fn settle(&self, delivery: Delivery, disposition: Disposition) {
        let tag = delivery.tag;
        let result = match disposition {
            Disposition::Ack => self.broker.ack(tag).await,
            Disposition::RetryLater { delay } => {
                let attempt = delivery.message.attempt() + 1;
                let retry = retry_copy(delivery.message, delay);
                match self.broker.publish(&delivery.queue, retry).await {
                    Ok(()) => {
                        debug!(worker = %self.label, queue = %delivery.queue, attempt, ?delay, "retry scheduled");
                        self.broker.ack(tag).await
                    }
                    Err(e) => {
                        warn!(worker = %self.label, queue = %delivery.queue, error = %e, "retry publish failed, requeueing");
                        self.broker.nack(tag, true).await
                    }
                }
            }
            Disposition::DeadLetter(reason) => {
                warn!(worker = %self.label, queue = %delivery.queue, message_id = %delivery.message.id, %reason, "dead-lettering");
                self.broker.nack(tag, false).await
            }
        };
        if let Err(e) = result {
            warn!(worker = %self.label, error = %e, "settling delivery failed");
        }
    }
}

/// Same id and body, one more attempt.
fn retry_copy(message: Message, delay: Duration) -> Message {
    let attempt = message.attempt() + 1;
    message.with_header(ATTEMPT_HEADER, attempt).with_delay(delay)
}
