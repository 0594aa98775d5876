//! RewardStage - チェーン最終ステージ
//!
//! 分類結果から reward を評価し、新規 grant なら永続化を別 queue に流します。
//! reward は付加価値なので、ここで起きたエラーは `reward: null` になるだけでステージは失敗しません。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use super::dispatcher::RewardDispatcher;
use super::evaluator::EvaluatorRegistry;
use crate::domain::{
    Classification, GrantOutcome, RewardRequest, RewardSource, RewardSummary, RunContext,
    StageError, StageId, StageOutput, StoreError,
};
use crate::ports::{Catalog, StageHandler};

pub struct RewardStage {
    registry: EvaluatorRegistry,
    catalog: Arc<dyn Catalog>,
    dispatcher: Arc<RewardDispatcher>,
}

impl RewardStage {
    pub fn new(
        registry: EvaluatorRegistry,
        catalog: Arc<dyn Catalog>,
        dispatcher: Arc<RewardDispatcher>,
    ) -> Self {
        Self {
            registry,
            catalog,
            dispatcher,
        }
    }

    async fn reward(&self, request: RewardRequest) -> Result<RewardSummary, StoreError> {
        let Some(evaluator) = self.registry.get(request.source) else {
            return Err(StoreError::Unavailable(format!(
                "no evaluator registered for {}",
                request.source
            )));
        };
        let catalog = self.catalog.items().await?;
        let decision = evaluator.evaluate(&request, &catalog);
        if !decision.should_evaluate {
            return Ok(RewardSummary::from_outcome(&GrantOutcome::NoCandidate, &decision));
        }

        let outcome = self
            .dispatcher
            .apply(request.owner_id, &decision.source_label, &decision.candidates)
            .await?;
        if let Some(grant) = outcome.grant_to_persist() {
            let receipt = self.dispatcher.dispatch_persistence(grant).await;
            if !receipt.all_durable() {
                warn!(run_id = %request.run_id, key = %grant.key(), "grant persistence partially lost");
            }
        }
        Ok(RewardSummary::from_outcome(&outcome, &decision))
    }
}

/// Build the evaluation request from what earlier stages left in the context.
pub fn reward_request(ctx: &RunContext) -> RewardRequest {
    let classification_result = ctx.get("classification_result");
    let classification = classification_result
        .and_then(|r| r.get("classification"))
        .and_then(|c| serde_json::from_value::<Classification>(c.clone()).ok())
        .unwrap_or_default();
    let situation_tags = classification_result
        .and_then(|r| r.get("situation_tags"))
        .map(strings)
        .unwrap_or_default();
    let insufficiencies = ctx
        .get("final_answer")
        .and_then(|a| a.get("insufficiencies"))
        .map(strings)
        .unwrap_or_default();

    RewardRequest {
        source: RewardSource::Scan,
        owner_id: ctx.owner_id(),
        run_id: ctx.run_id(),
        classification,
        situation_tags,
        disposal_rules_present: ctx.get("disposal_rules").is_some_and(is_present),
        insufficiencies,
    }
}

fn strings(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Bool(b) => *b,
        Value::Number(_) => true,
    }
}

#[async_trait]
impl StageHandler for RewardStage {
    fn stage(&self) -> StageId {
        StageId::Reward
    }

    async fn run(&self, ctx: &RunContext) -> Result<StageOutput, StageError> {
        let request = reward_request(ctx);
        let reward = match self.reward(request).await {
            Ok(summary) => {
                info!(run_id = %ctx.run_id(), received = summary.received, already_owned = summary.already_owned, "reward evaluated");
                serde_json::to_value(summary).unwrap_or(Value::Null)
            }
            Err(e) => {
                warn!(run_id = %ctx.run_id(), error = %e, "reward evaluation failed");
                Value::Null
            }
        };
        let mut output = Map::new();
        output.insert("reward".to_string(), reward);
        Ok(output)
    }
}

/// `classification_result` as the vision stage writes it. Used by demos and tests.
pub fn classification_result(major: &str, middle: &str, minor: Option<&str>) -> Value {
    json!({
        "classification": {
            "major_category": major,
            "middle_category": middle,
            "minor_category": minor,
        },
        "situation_tags": [],
    })
}
