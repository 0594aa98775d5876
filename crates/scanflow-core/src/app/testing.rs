//! Test doubles shared by the app-layer tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{RunContext, StageError, StageEvent, StageId, StageOutput};
use crate::ports::{EventConsumer, StageHandler};

/// Stage handler backed by a closure. The closure also gets the 0-based call count.
pub(crate) struct FnStage<F> {
    stage: StageId,
    f: F,
    calls: AtomicU32,
    latency: Duration,
}

impl<F> FnStage<F>
where
    F: Fn(&RunContext, u32) -> Result<StageOutput, StageError> + Send + Sync,
{
    pub(crate) fn new(stage: StageId, f: F) -> Self {
        Self {
            stage,
            f,
            calls: AtomicU32::new(0),
            latency: Duration::ZERO,
        }
    }

    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<F> StageHandler for FnStage<F>
where
    F: Fn(&RunContext, u32) -> Result<StageOutput, StageError> + Send + Sync,
{
    fn stage(&self) -> StageId {
        self.stage
    }

    async fn run(&self, ctx: &RunContext) -> Result<StageOutput, StageError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        (self.f)(ctx, call)
    }
}

pub(crate) fn output(value: Value) -> StageOutput {
    match value {
        Value::Object(map) => map,
        other => panic!("stage output must be an object, got {other}"),
    }
}

/// Everything currently buffered for this consumer.
pub(crate) fn drain(consumer: &mut Box<dyn EventConsumer>) -> Vec<StageEvent> {
    let mut events = Vec::new();
    while let Ok(Some(event)) = consumer.next_event(Duration::ZERO) {
        events.push(event);
    }
    events
}
