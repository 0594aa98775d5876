//! PipelineBuilder - パイプラインの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）: chain の全ステージに handler が必要
//! - ports は `Arc<dyn Trait>` で注入

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use tracing::info;

use super::executor::StageExecutor;
use super::publisher_loop::{PublishOutcome, ReliablePublisher};
use super::worker_loop::WorkerGroup;
use crate::config::PipelineConfig;
use crate::domain::{
    BuildError, Chain, Message, OwnerId, RunContext, RunId, StageEvent, StageEventType, StageId,
    StageMessage, SubmitError,
};
use crate::ports::{Broker, Clock, EventPublisher, IdGenerator, OutboxStore, StageHandler};

/// Injected adapters.
#[derive(Clone)]
pub struct Services {
    pub broker: Arc<dyn Broker>,
    pub events: Arc<dyn EventPublisher>,
    pub outbox: Arc<dyn OutboxStore>,
    pub ids: Arc<dyn IdGenerator>,
    pub clock: Arc<dyn Clock>,
    /// Outbox category for stage hand-offs.
    pub outbox_key: String,
}

/// What a client submits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanInput {
    pub owner_id: OwnerId,
    pub image_url: String,
    pub user_input: Option<String>,
}

/// PipelineBuilder はパイプラインを構築
///
/// # 使用例
/// ```ignore
/// let pipeline = PipelineBuilder::new(Chain::standard(), services)
///     .register(Arc::new(VisionStage::new(..)))?
///     .register(Arc::new(RuleStage::new(..)))?
///     .register(Arc::new(AnswerStage::new(..)))?
///     .register(Arc::new(reward_stage))?
///     .build()?;
/// ```
pub struct PipelineBuilder {
    chain: Chain,
    services: Services,
    handlers: BTreeMap<StageId, Arc<dyn StageHandler>>,
}

impl PipelineBuilder {
    pub fn new(chain: Chain, services: Services) -> Self {
        Self {
            chain,
            services,
            handlers: BTreeMap::new(),
        }
    }

    /// One handler per stage.
    pub fn register(mut self, handler: Arc<dyn StageHandler>) -> Result<Self, BuildError> {
        let stage = handler.stage();
        if self.handlers.contains_key(&stage) {
            return Err(BuildError::DuplicateHandler(stage));
        }
        self.handlers.insert(stage, handler);
        Ok(self)
    }

    /// 不足があれば BuildError::MissingStages を返す
    pub fn build(self) -> Result<Pipeline, BuildError> {
        let missing: Vec<StageId> = StageId::CHAIN
            .into_iter()
            .filter(|stage| !self.handlers.contains_key(stage))
            .collect();
        if !missing.is_empty() {
            return Err(BuildError::MissingStages(missing));
        }

        let services = self.services;
        let publisher = Arc::new(ReliablePublisher::new(
            Arc::clone(&services.broker),
            Arc::clone(&services.outbox),
            services.outbox_key.clone(),
        ));
        let executors = self
            .handlers
            .into_iter()
            .map(|(stage, handler)| {
                let executor = StageExecutor::new(
                    &self.chain,
                    handler,
                    Arc::clone(&publisher),
                    Arc::clone(&services.events),
                    Arc::clone(&services.ids),
                    Arc::clone(&services.clock),
                );
                (stage, Arc::new(executor))
            })
            .collect();

        Ok(Pipeline {
            chain: self.chain,
            services,
            publisher,
            executors,
        })
    }
}

/// Pipeline はステージ実行の入口
pub struct Pipeline {
    chain: Chain,
    services: Services,
    publisher: Arc<ReliablePublisher>,
    executors: BTreeMap<StageId, Arc<StageExecutor>>,
}

impl Pipeline {
    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn executor(&self, stage: StageId) -> Option<Arc<StageExecutor>> {
        self.executors.get(&stage).cloned()
    }

    pub fn publisher(&self) -> Arc<ReliablePublisher> {
        Arc::clone(&self.publisher)
    }

    /// Enqueue the first stage. The run id doubles as the first task id.
    ///
    /// A broker outage is not an error here: the message waits in the outbox.
    pub async fn submit(&self, input: ScanInput) -> Result<RunId, SubmitError> {
        if input.image_url.trim().is_empty() {
            return Err(SubmitError::InvalidInput("image_url is required".into()));
        }

        let run_id = self.services.ids.generate_task_id();
        let mut context = RunContext::new(run_id, input.owner_id)
            .with_value("image_url", json!(input.image_url));
        if let Some(text) = input.user_input.filter(|t| !t.trim().is_empty()) {
            context = context.with_value("user_input", json!(text));
        }

        let first = self.chain.descriptor(StageId::first());
        let message = StageMessage {
            task_id: run_id,
            root_id: run_id,
            parent_id: None,
            stage: first.id,
            context,
        };
        let body = Message::json(&message).map_err(|e| SubmitError::NotEnqueued(e.to_string()))?;

        let outcome = self.publisher.publish(&first.queue, body).await;
        if outcome == PublishOutcome::Lost {
            return Err(SubmitError::NotEnqueued(format!(
                "{} and its outbox both refused the message",
                first.queue
            )));
        }

        let sent = StageEvent::new(StageEventType::Sent, run_id, self.services.clock.now())
            .with_root(run_id)
            .with_stage(first.id);
        if let Err(e) = self.services.events.emit(sent) {
            tracing::warn!(%run_id, error = %e, "sent event dropped");
        }
        info!(%run_id, owner_id = %input.owner_id, ?outcome, "scan submitted");
        Ok(run_id)
    }

    /// One worker group per stage, each on its own queue.
    pub fn spawn_workers(&self, config: &PipelineConfig) -> Vec<WorkerGroup> {
        self.executors
            .iter()
            .map(|(stage, executor)| {
                WorkerGroup::spawn(
                    format!("stage-{stage}"),
                    config.worker_concurrency,
                    executor.descriptor().queue.clone(),
                    Arc::clone(&self.services.broker),
                    executor.clone(),
                    config.consume_wait,
                )
            })
            .collect()
    }
}
