//! Lifecycle events emitted on the broker, and the versioned final-result schema.
//!
//! Producer 側は最終結果を常に `ResultEnvelope { schema_version, result }` で包みます。
//! Consumer はこの schema に対して 1 本の parse 経路だけを持ちます。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::context::RunContext;
use super::ids::{RunId, TaskId};
use super::reward::RewardSummary;
use super::stage::StageId;

pub const RESULT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageEventType {
    Sent,
    Received,
    Started,
    Succeeded,
    Failed,
    /// Custom event carrying the final structured payload.
    Result,
}

/// Payload as it comes off the wire.
///
/// Legacy producers sent stringified structures, so both shapes exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Text(String),
    Json(Value),
}

/// Broker-origin lifecycle event. Ephemeral.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEvent {
    pub event_type: StageEventType,
    pub task_id: TaskId,
    pub root_id: Option<TaskId>,
    pub parent_id: Option<TaskId>,
    /// Raw stage name. Some event types omit it.
    pub stage_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: Option<EventPayload>,
}

impl StageEvent {
    pub fn new(event_type: StageEventType, task_id: TaskId, timestamp: DateTime<Utc>) -> Self {
        Self {
            event_type,
            task_id,
            root_id: None,
            parent_id: None,
            stage_name: None,
            timestamp,
            payload: None,
        }
    }

    pub fn with_root(mut self, root_id: RunId) -> Self {
        self.root_id = Some(root_id);
        self
    }

    pub fn with_parent(mut self, parent_id: Option<TaskId>) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn with_stage(mut self, stage: StageId) -> Self {
        self.stage_name = Some(stage.as_str().to_string());
        self
    }

    pub fn with_payload(mut self, payload: EventPayload) -> Self {
        self.payload = Some(payload);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutput {
    pub classification_result: Value,
    pub disposal_rules: Value,
    pub final_answer: Value,
}

/// Final result nested in the terminal `completed` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub task_id: RunId,
    pub status: String,
    pub message: String,
    pub pipeline_result: PipelineOutput,
    pub reward: Option<RewardSummary>,
    pub error: Option<String>,
    /// `duration_<stage>_ms` entries and `duration_total_ms`.
    #[serde(default)]
    pub metadata: BTreeMap<String, f64>,
}

impl ScanResult {
    pub fn from_context(ctx: &RunContext) -> Self {
        let field = |key: &str| ctx.get(key).cloned().unwrap_or(Value::Null);
        let reward = ctx
            .get("reward")
            .and_then(|value| serde_json::from_value(value.clone()).ok());
        Self {
            task_id: ctx.run_id(),
            status: "completed".to_string(),
            message: "classification completed".to_string(),
            pipeline_result: PipelineOutput {
                classification_result: field("classification_result"),
                disposal_rules: field("disposal_rules"),
                final_answer: field("final_answer"),
            },
            reward,
            error: None,
            metadata: ctx.metadata().clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub schema_version: u32,
    pub result: ScanResult,
}

impl ResultEnvelope {
    pub fn v1(result: ScanResult) -> Self {
        Self {
            schema_version: RESULT_SCHEMA_VERSION,
            result,
        }
    }
}
