//! Broker messages, deliveries, and the stage message body.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use ulid::Ulid;

use super::context::RunContext;
use super::errors::BrokerError;
use super::ids::{MessageId, RunId, TaskId};
use super::stage::StageId;

/// Executor attempt counter (0 = first try).
pub const ATTEMPT_HEADER: &str = "x-attempt";
/// Incremented by the DLQ reprocessor on every republish.
pub const DLQ_RETRY_HEADER: &str = "x-dlq-retry-count";
pub const DEATH_REASON_HEADER: &str = "x-death-reason";
pub const FIRST_DEATH_QUEUE_HEADER: &str = "x-first-death-queue";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    #[serde(default)]
    pub headers: BTreeMap<String, Value>,
    pub body: Value,
    /// Not visible to consumers until this much time has passed after publish.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
}

impl Message {
    pub fn new(body: Value) -> Self {
        Self {
            id: MessageId::from_ulid(Ulid::new()),
            headers: BTreeMap::new(),
            body,
            delay_ms: None,
        }
    }

    pub fn json<T: Serialize>(body: &T) -> Result<Self, BrokerError> {
        serde_json::to_value(body)
            .map(Self::new)
            .map_err(|e| BrokerError::Encoding(e.to_string()))
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.body)
    }

    /// Missing or non-numeric headers read as 0.
    pub fn header_u32(&self, key: &str) -> u32 {
        self.headers
            .get(key)
            .and_then(Value::as_u64)
            .map(|n| n.min(u32::MAX as u64) as u32)
            .unwrap_or(0)
    }

    pub fn with_header(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.headers.insert(key.to_string(), value.into());
        self
    }

    pub fn without_header(mut self, key: &str) -> Self {
        self.headers.remove(key);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = (!delay.is_zero()).then(|| delay.as_millis() as u64);
        self
    }

    pub fn delay(&self) -> Option<Duration> {
        self.delay_ms.map(Duration::from_millis)
    }

    pub fn attempt(&self) -> u32 {
        self.header_u32(ATTEMPT_HEADER)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(pub u64);

/// A message handed to a consumer but not yet acked.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub queue: String,
    pub message: Message,
    pub redelivered: bool,
}

/// Body of every pipeline stage message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageMessage {
    pub task_id: TaskId,
    pub root_id: RunId,
    pub parent_id: Option<TaskId>,
    pub stage: StageId,
    pub context: RunContext,
}
