//! Lifecycle event bus ports.
//!
//! 購読側は blocking な consume ループです。
//! async 側から使うときは専用スレッドで回し、bounded channel で橋渡しします。

use std::time::Duration;

use crate::domain::{BrokerError, StageEvent};

/// Producer side. Emission is fire-and-forget; events are ephemeral.
pub trait EventPublisher: Send + Sync {
    fn emit(&self, event: StageEvent) -> Result<(), BrokerError>;
}

/// Subscription factory. `subscribe` returns only once the consumer is bound,
/// so every event emitted afterwards is delivered to it.
pub trait EventSource: Send + Sync {
    fn subscribe(&self) -> Result<Box<dyn EventConsumer>, BrokerError>;
}

pub trait EventConsumer: Send {
    /// Block up to `timeout` for the next event.
    fn next_event(&mut self, timeout: Duration) -> Result<Option<StageEvent>, BrokerError>;
}
