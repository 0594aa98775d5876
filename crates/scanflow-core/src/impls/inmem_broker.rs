//! In-memory broker.
//!
//! Queues are declared up front from a [`Topology`]. Delayed messages sit in a
//! min-heap until visible. Rejected and expired messages follow the queue's
//! dead-letter binding.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::message::{DEATH_REASON_HEADER, FIRST_DEATH_QUEUE_HEADER};
use crate::domain::{BrokerError, Delivery, DeliveryTag, Message, QueueSpec, Topology};
use crate::observability::QueueStats;
use crate::ports::Broker;

/// Delayed message entry.
///
/// We use Reverse ordering so BinaryHeap acts as a min-heap (earliest first).
#[derive(Debug)]
struct Delayed {
    visible_at: Instant,
    seq: u64,
    queue: String,
    message: Message,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.visible_at == other.visible_at && self.seq == other.seq
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .visible_at
            .cmp(&self.visible_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
struct Ready {
    message: Message,
    ready_at: Instant,
    redelivered: bool,
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<Ready>,
}

struct BrokerState {
    queues: HashMap<String, QueueState>,
    delayed: BinaryHeap<Delayed>,
    unacked: HashMap<DeliveryTag, (String, Message)>,
    next_tag: u64,
    next_seq: u64,
}

impl BrokerState {
    fn push_ready(&mut self, queue: &str, message: Message, now: Instant) -> Result<(), BrokerError> {
        let state = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        state.ready.push_back(Ready {
            message,
            ready_at: now,
            redelivered: false,
        });
        Ok(())
    }

    /// Move delayed messages whose time has come.
    fn promote_delayed(&mut self, now: Instant) {
        while let Some(entry) = self.delayed.peek() {
            if entry.visible_at > now {
                break; // Heap is sorted, so we can stop
            }
            let Some(entry) = self.delayed.pop() else {
                break;
            };
            if let Err(e) = self.push_ready(&entry.queue, entry.message, now) {
                warn!(error = %e, "dropping delayed message");
            }
        }
    }

    fn expire(&mut self, queue: &str, now: Instant) {
        let Some(state) = self.queues.get_mut(queue) else {
            return;
        };
        let Some(ttl) = state.spec.message_ttl else {
            return;
        };
        let (expired, alive): (VecDeque<Ready>, VecDeque<Ready>) = std::mem::take(&mut state.ready)
            .into_iter()
            .partition(|r| now.duration_since(r.ready_at) >= ttl);
        state.ready = alive;
        for entry in expired {
            self.dead_letter(queue, entry.message, "expired", now);
        }
    }

    fn dead_letter(&mut self, from: &str, mut message: Message, reason: &str, now: Instant) {
        let target = self
            .queues
            .get(from)
            .and_then(|q| q.spec.dead_letter.as_ref())
            .map(|binding| binding.routing_key.clone());
        let Some(target) = target else {
            warn!(queue = from, reason, message_id = %message.id, "no dead-letter binding, message dropped");
            return;
        };
        message
            .headers
            .insert(DEATH_REASON_HEADER.to_string(), Value::from(reason));
        message
            .headers
            .entry(FIRST_DEATH_QUEUE_HEADER.to_string())
            .or_insert_with(|| Value::from(from));
        message.delay_ms = None;
        debug!(queue = from, dlq = %target, reason, "dead-lettered");
        if let Err(e) = self.push_ready(&target, message, now) {
            warn!(error = %e, "dead-letter target missing, message dropped");
        }
    }

    fn pop(&mut self, queue: &str, now: Instant) -> Result<Option<Delivery>, BrokerError> {
        if !self.queues.contains_key(queue) {
            return Err(BrokerError::UnknownQueue(queue.to_string()));
        }
        self.promote_delayed(now);
        self.expire(queue, now);

        let Some(entry) = self.queues.get_mut(queue).and_then(|q| q.ready.pop_front()) else {
            return Ok(None);
        };
        let tag = DeliveryTag(self.next_tag);
        self.next_tag += 1;
        self.unacked
            .insert(tag, (queue.to_string(), entry.message.clone()));
        Ok(Some(Delivery {
            tag,
            queue: queue.to_string(),
            message: entry.message,
            redelivered: entry.redelivered,
        }))
    }

    fn next_delayed_at(&self) -> Option<Instant> {
        self.delayed.peek().map(|entry| entry.visible_at)
    }
}

/// In-memory broker implementation.
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
    publish_failures: AtomicU32,
    publish_down: AtomicBool,
}

impl InMemoryBroker {
    pub fn new(topology: &Topology) -> Self {
        let queues = topology
            .queues()
            .iter()
            .map(|spec| {
                (
                    spec.name.clone(),
                    QueueState {
                        spec: spec.clone(),
                        ready: VecDeque::new(),
                    },
                )
            })
            .collect();
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                queues,
                delayed: BinaryHeap::new(),
                unacked: HashMap::new(),
                next_tag: 1,
                next_seq: 0,
            })),
            notify: Arc::new(Notify::new()),
            publish_failures: AtomicU32::new(0),
            publish_down: AtomicBool::new(false),
        }
    }

    /// The next `n` publishes fail with `Unavailable`.
    pub fn fail_next_publishes(&self, n: u32) {
        self.publish_failures.store(n, Ordering::SeqCst);
    }

    /// Every publish fails while down.
    pub fn set_publish_down(&self, down: bool) {
        self.publish_down.store(down, Ordering::SeqCst);
    }

    pub async fn stats(&self, queue: &str) -> QueueStats {
        let state = self.state.lock().await;
        QueueStats {
            ready: state.queues.get(queue).map_or(0, |q| q.ready.len()),
            delayed: state.delayed.iter().filter(|d| d.queue == queue).count(),
            unacked: state.unacked.values().filter(|(q, _)| q == queue).count(),
        }
    }

    /// Snapshot of the ready messages of `queue`, head first.
    pub async fn messages(&self, queue: &str) -> Vec<Message> {
        let state = self.state.lock().await;
        state
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|r| r.message.clone()).collect())
            .unwrap_or_default()
    }

    fn check_publish_path(&self) -> Result<(), BrokerError> {
        if self.publish_down.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("connection refused".into()));
        }
        let consumed = self
            .publish_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if consumed.is_ok() {
            return Err(BrokerError::Unavailable("injected publish failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, queue: &str, message: Message) -> Result<(), BrokerError> {
        self.check_publish_path()?;

        let mut state = self.state.lock().await;
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::UnknownQueue(queue.to_string()));
        }
        let now = Instant::now();
        match message.delay() {
            Some(delay) => {
                let seq = state.next_seq;
                state.next_seq += 1;
                state.delayed.push(Delayed {
                    visible_at: now + delay,
                    seq,
                    queue: queue.to_string(),
                    message,
                });
            }
            None => state.push_ready(queue, message, now)?,
        }
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let mut state = self.state.lock().await;
        state.pop(queue, Instant::now())
    }

    async fn consume(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // publish との取りこぼしを防ぐため、ロック解放前に登録しておく
            notified.as_mut().enable();

            let next_wake = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                if let Some(delivery) = state.pop(queue, now)? {
                    return Ok(Some(delivery));
                }
                if now >= deadline {
                    return Ok(None);
                }
                state
                    .next_delayed_at()
                    .map_or(deadline, |at| at.min(deadline))
            };

            tokio::select! {
                _ = &mut notified => {},
                _ = tokio::time::sleep_until(next_wake) => {},
            }
        }
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state
            .unacked
            .remove(&tag)
            .map(|_| ())
            .ok_or(BrokerError::UnknownDelivery(tag.0))
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let (queue, message) = state
            .unacked
            .remove(&tag)
            .ok_or(BrokerError::UnknownDelivery(tag.0))?;
        let now = Instant::now();
        if requeue {
            if let Some(q) = state.queues.get_mut(&queue) {
                q.ready.push_front(Ready {
                    message,
                    ready_at: now,
                    redelivered: true,
                });
            }
            drop(state);
            self.notify.notify_waiters();
        } else {
            state.dead_letter(&queue, message, "rejected", now);
        }
        Ok(())
    }
}
