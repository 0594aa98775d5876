//! RunContext - ステージ間で受け渡される蓄積コンテキスト
//!
//! # 不変条件
//! - キーは追加のみ。前のステージのキーを削除・上書きできない
//! - `metadata` だけは共有領域で、各ステージが `duration_<stage>_ms` を追記する
//! - 最終ステージで `duration_total_ms` = 各ステージ duration の合計（epsilon 以内）

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

use super::errors::ContextError;
use super::ids::{OwnerId, RunId};
use super::stage::StageId;

pub const METADATA_KEY: &str = "metadata";
pub const TOTAL_DURATION_KEY: &str = "duration_total_ms";
pub const DURATION_EPSILON: f64 = 1e-6;

/// What a stage handler hands back: new keys to merge.
pub type StageOutput = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    run_id: RunId,
    owner_id: OwnerId,
    data: Map<String, Value>,
    metadata: BTreeMap<String, f64>,
}

impl RunContext {
    pub fn new(run_id: RunId, owner_id: OwnerId) -> Self {
        Self {
            run_id,
            owner_id,
            data: Map::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Seed a submission key. Only used before the first stage runs.
    pub fn with_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn owner_id(&self) -> OwnerId {
        self.owner_id
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn metadata(&self) -> &BTreeMap<String, f64> {
        &self.metadata
    }

    /// Merge a stage's output. All-or-nothing: on error nothing is applied.
    ///
    /// Re-merging an identical value is accepted so a redelivered stage stays idempotent.
    pub fn merge(&mut self, stage: StageId, output: StageOutput) -> Result<(), ContextError> {
        for (key, value) in &output {
            if key == METADATA_KEY {
                return Err(ContextError::ReservedKey {
                    stage,
                    key: key.clone(),
                });
            }
            if let Some(existing) = self.data.get(key)
                && existing != value
            {
                return Err(ContextError::KeyConflict {
                    stage,
                    key: key.clone(),
                });
            }
        }
        self.data.extend(output);
        Ok(())
    }

    pub fn record_duration(&mut self, stage: StageId, elapsed: Duration) {
        self.metadata
            .insert(stage.duration_key(), elapsed.as_secs_f64() * 1000.0);
    }

    fn stage_duration_sum(&self) -> f64 {
        self.metadata
            .iter()
            .filter(|(key, _)| key.as_str() != TOTAL_DURATION_KEY)
            .map(|(_, ms)| ms)
            .sum()
    }

    /// Compute and store `duration_total_ms`.
    pub fn finalize_total(&mut self) -> f64 {
        let total = self.stage_duration_sum();
        self.metadata.insert(TOTAL_DURATION_KEY.to_string(), total);
        total
    }

    pub fn check_durations(&self) -> Result<(), ContextError> {
        let sum = self.stage_duration_sum();
        let total = self
            .metadata
            .get(TOTAL_DURATION_KEY)
            .copied()
            .unwrap_or(f64::NAN);
        if (total - sum).abs() <= DURATION_EPSILON {
            Ok(())
        } else {
            Err(ContextError::DurationMismatch { total, sum })
        }
    }

    /// Flat JSON view: data keys plus the `metadata` sub-map.
    pub fn to_json(&self) -> Value {
        let mut map = self.data.clone();
        let metadata: Map<String, Value> = self
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(*v)))
            .collect();
        map.insert(METADATA_KEY.to_string(), Value::Object(metadata));
        Value::Object(map)
    }
}
