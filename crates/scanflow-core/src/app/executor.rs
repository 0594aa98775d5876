//! StageExecutor - 1 delivery 分のステージ実行
//!
//! # フロー
//! 1. `received` → `started` を emit
//! 2. handler を hard timeout 付きで実行（soft timeout は warn のみ）
//! 3. context に merge して `duration_<stage>_ms` を記録
//! 4. 次ステージがあれば publish して `sent` / `succeeded`、最終ステージなら
//!    `duration_total_ms` を検証して `succeeded` / `result`
//!
//! 失敗時の判定（retry / dead-letter）は [`Disposition`] として worker に返します。

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::publisher_loop::{PublishOutcome, ReliablePublisher};
use super::worker_loop::{DeliveryHandler, Disposition};
use crate::domain::{
    Chain, Delivery, ErrorKind, EventPayload, Message, ResultEnvelope, RunContext, ScanResult,
    StageDescriptor, StageError, StageEvent, StageEventType, StageMessage, StageOutput, TaskId,
};
use crate::ports::{Clock, EventPublisher, IdGenerator, StageHandler};

pub struct StageExecutor {
    descriptor: StageDescriptor,
    next: Option<StageDescriptor>,
    handler: Arc<dyn StageHandler>,
    publisher: Arc<ReliablePublisher>,
    events: Arc<dyn EventPublisher>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
}

impl StageExecutor {
    pub fn new(
        chain: &Chain,
        handler: Arc<dyn StageHandler>,
        publisher: Arc<ReliablePublisher>,
        events: Arc<dyn EventPublisher>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let stage = handler.stage();
        Self {
            descriptor: chain.descriptor(stage).clone(),
            next: stage.next().map(|next| chain.descriptor(next).clone()),
            handler,
            publisher,
            events,
            ids,
            clock,
        }
    }

    pub fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    /// Run one attempt of this stage. `attempt` is 0 for the first try.
    pub async fn execute(&self, message: StageMessage, attempt: u32) -> Disposition {
        let stage = self.descriptor.id;
        self.emit(StageEventType::Received, &message, None);
        self.emit(StageEventType::Started, &message, None);
        debug!(run_id = %message.root_id, task_id = %message.task_id, %stage, attempt, "stage started");

        let started = Instant::now();
        let mut context = message.context.clone();
        let result = self
            .run_guarded(&context)
            .await
            .and_then(|output| {
                context
                    .merge(stage, output)
                    .map_err(|e| StageError::permanent(e.to_string()))
            });
        let result = match result {
            Ok(()) => {
                context.record_duration(stage, started.elapsed());
                self.advance(&message, context).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => Disposition::Ack,
            Err(err) => self.fail(&message, attempt, err),
        }
    }

    /// hard timeout を超えたら transient 扱い
    async fn run_guarded(&self, context: &RunContext) -> Result<StageOutput, StageError> {
        let soft = self.descriptor.soft_timeout;
        let hard = self.descriptor.hard_timeout;
        let stage = self.descriptor.id;
        let run = self.handler.run(context);

        let guarded = async move {
            tokio::pin!(run);
            tokio::select! {
                result = &mut run => return result,
                _ = tokio::time::sleep(soft) => {
                    warn!(run_id = %context.run_id(), %stage, ?soft, "soft timeout exceeded");
                }
            }
            run.await
        };

        match tokio::time::timeout(hard, guarded).await {
            Ok(result) => result,
            Err(_) => Err(StageError::transient(format!(
                "hard timeout exceeded after {}s",
                hard.as_secs()
            ))),
        }
    }

    async fn advance(&self, message: &StageMessage, context: RunContext) -> Result<(), StageError> {
        let Some(next) = &self.next else {
            return self.complete(message, context);
        };

        let next_task = self.ids.generate_task_id();
        let next_message = StageMessage {
            task_id: next_task,
            root_id: message.root_id,
            parent_id: Some(message.task_id),
            stage: next.id,
            context,
        };
        let body = Message::json(&next_message).map_err(|e| StageError::permanent(e.to_string()))?;

        if self.publisher.publish(&next.queue, body).await == PublishOutcome::Lost {
            return Err(StageError::transient(format!(
                "could not hand off to {}",
                next.id
            )));
        }
        self.emit_sent(next_task, &next_message);
        self.emit(StageEventType::Succeeded, message, None);
        Ok(())
    }

    fn complete(&self, message: &StageMessage, mut context: RunContext) -> Result<(), StageError> {
        let total = context.finalize_total();
        context
            .check_durations()
            .map_err(|e| StageError::permanent(e.to_string()))?;

        self.emit(StageEventType::Succeeded, message, None);
        let envelope = ResultEnvelope::v1(ScanResult::from_context(&context));
        let payload = match serde_json::to_value(&envelope) {
            Ok(value) => Some(EventPayload::Json(value)),
            Err(e) => {
                error!(run_id = %message.root_id, error = %e, "result payload encoding failed");
                None
            }
        };
        self.emit(StageEventType::Result, message, payload);
        info!(run_id = %message.root_id, duration_total_ms = total, "run completed");
        Ok(())
    }

    fn fail(&self, message: &StageMessage, attempt: u32, err: StageError) -> Disposition {
        let stage = self.descriptor.id;
        let max_retries = self.descriptor.max_retries;
        if err.kind() == ErrorKind::Transient && attempt < max_retries {
            warn!(run_id = %message.root_id, task_id = %message.task_id, %stage, attempt, error = %err, "transient failure, retrying");
            return Disposition::RetryLater {
                delay: self.descriptor.retry_delay,
            };
        }

        match err.kind() {
            ErrorKind::Transient => {
                error!(run_id = %message.root_id, task_id = %message.task_id, %stage, attempt, error = %err, "retries exhausted")
            }
            ErrorKind::Permanent => {
                error!(run_id = %message.root_id, task_id = %message.task_id, %stage, error = %err, "permanent failure")
            }
        }
        let reason = err.to_string();
        self.emit(
            StageEventType::Failed,
            message,
            Some(EventPayload::Text(reason.clone())),
        );
        Disposition::DeadLetter(reason)
    }

    fn emit(&self, event_type: StageEventType, message: &StageMessage, payload: Option<EventPayload>) {
        let mut event = StageEvent::new(event_type, message.task_id, self.clock.now())
            .with_root(message.root_id)
            .with_parent(message.parent_id)
            .with_stage(message.stage);
        if let Some(payload) = payload {
            event = event.with_payload(payload);
        }
        self.send(event);
    }

    fn emit_sent(&self, task_id: TaskId, next: &StageMessage) {
        let event = StageEvent::new(StageEventType::Sent, task_id, self.clock.now())
            .with_root(next.root_id)
            .with_parent(next.parent_id)
            .with_stage(next.stage);
        self.send(event);
    }

    /// Event loss is logged and never fails the stage.
    fn send(&self, event: StageEvent) {
        let event_type = event.event_type;
        if let Err(e) = self.events.emit(event) {
            warn!(?event_type, error = %e, "lifecycle event dropped");
        }
    }
}

#[async_trait]
impl DeliveryHandler for StageExecutor {
    async fn handle(&self, delivery: &Delivery) -> Disposition {
        let message: StageMessage = match delivery.message.decode() {
            Ok(message) => message,
            Err(e) => {
                error!(queue = %delivery.queue, message_id = %delivery.message.id, error = %e, "undecodable stage message");
                return Disposition::DeadLetter(format!("undecodable stage message: {e}"));
            }
        };
        if message.stage != self.descriptor.id {
            error!(queue = %delivery.queue, expected = %self.descriptor.id, got = %message.stage, "misrouted stage message");
            return Disposition::DeadLetter(format!("misrouted {} message", message.stage));
        }
        self.execute(message, delivery.message.attempt()).await
    }
}
