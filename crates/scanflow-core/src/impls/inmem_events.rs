//! InMemoryEventBus - 開発用の lifecycle event bus
//!
//! # 学習ポイント
//! - Mutex + Condvar による blocking 受信
//! - subscriber ごとの mailbox（fan-out）
//! - 購読前に emit されたイベントは届かない（broker の実際の挙動と同じ）

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use crate::domain::{BrokerError, StageEvent};
use crate::ports::{EventConsumer, EventPublisher, EventSource};

#[derive(Default)]
struct Mailbox {
    events: Mutex<VecDeque<StageEvent>>,
    condvar: Condvar,
}

/// InMemoryEventBus は subscriber ごとに mailbox を持つ broadcast bus
pub struct InMemoryEventBus {
    subscribers: Mutex<Vec<Weak<Mailbox>>>,
    /// 購読確立にかかる時間（broker への bind を模擬）
    subscribe_delay: Duration,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            subscribe_delay: Duration::ZERO,
        }
    }

    pub fn with_subscribe_delay(mut self, delay: Duration) -> Self {
        self.subscribe_delay = delay;
        self
    }

    /// Live subscriptions. Dropped consumers are pruned on the next emit.
    pub fn subscriber_count(&self) -> usize {
        let subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.iter().filter(|w| w.strong_count() > 0).count()
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventPublisher for InMemoryEventBus {
    fn emit(&self, event: StageEvent) -> Result<(), BrokerError> {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|w| w.strong_count() > 0);
        for mailbox in subscribers.iter().filter_map(Weak::upgrade) {
            let mut events = mailbox.events.lock().unwrap_or_else(PoisonError::into_inner);
            events.push_back(event.clone());
            mailbox.condvar.notify_one();
        }
        Ok(())
    }
}

impl EventSource for InMemoryEventBus {
    fn subscribe(&self) -> Result<Box<dyn EventConsumer>, BrokerError> {
        if !self.subscribe_delay.is_zero() {
            std::thread::sleep(self.subscribe_delay);
        }
        let mailbox = Arc::new(Mailbox::default());
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&mailbox));
        Ok(Box::new(InMemoryConsumer { mailbox }))
    }
}

pub struct InMemoryConsumer {
    mailbox: Arc<Mailbox>,
}

impl EventConsumer for InMemoryConsumer {
    fn next_event(&mut self, timeout: Duration) -> Result<Option<StageEvent>, BrokerError> {
        let start = Instant::now();
        let mut guard = self
            .mailbox
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(event) = guard.pop_front() {
                return Ok(Some(event));
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Ok(None);
            }
            let (new_guard, _) = self
                .mailbox
                .condvar
                .wait_timeout(guard, timeout - elapsed)
                .unwrap_or_else(PoisonError::into_inner);
            guard = new_guard;
        }
    }
}
