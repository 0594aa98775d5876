//! Stage - パイプラインのステージ定義
//!
//! 文字列による task ルーティングの代わりに、閉じた enum `StageId` と
//! 静的なステージ表 (`StageDescriptor`) を使います。
//! 未知のステージ名は `FromStr` の時点で拒否されるため、dispatch 時に失敗することはありません。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Closed set of pipeline stages, in chain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Vision,
    Rule,
    Answer,
    Reward,
}

static CHAIN_ORDER: [StageId; 4] = StageId::CHAIN;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown stage {0:?}")]
pub struct UnknownStage(pub String);

impl StageId {
    /// The fixed chain order.
    pub const CHAIN: [StageId; 4] = [
        StageId::Vision,
        StageId::Rule,
        StageId::Answer,
        StageId::Reward,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StageId::Vision => "vision",
            StageId::Rule => "rule",
            StageId::Answer => "answer",
            StageId::Reward => "reward",
        }
    }

    /// Position within [`StageId::CHAIN`].
    pub fn position(self) -> usize {
        match self {
            StageId::Vision => 0,
            StageId::Rule => 1,
            StageId::Answer => 2,
            StageId::Reward => 3,
        }
    }

    pub fn first() -> StageId {
        Self::CHAIN[0]
    }

    pub fn next(self) -> Option<StageId> {
        Self::CHAIN.get(self.position() + 1).copied()
    }

    pub fn previous(self) -> Option<StageId> {
        self.position()
            .checked_sub(1)
            .map(|index| Self::CHAIN[index])
    }

    pub fn is_final(self) -> bool {
        self.next().is_none()
    }

    /// Stages strictly before this one, in chain order.
    pub fn predecessors(self) -> &'static [StageId] {
        &CHAIN_ORDER[..self.position()]
    }

    /// `(own progress, previous stage progress)`.
    ///
    /// "started" は previous を、"succeeded" は own を報告します。
    pub fn progress(self) -> (u8, u8) {
        match self {
            StageId::Vision => (25, 0),
            StageId::Rule => (50, 25),
            StageId::Answer => (75, 50),
            StageId::Reward => (100, 75),
        }
    }

    /// Metadata key for this stage's wall-clock duration.
    pub fn duration_key(self) -> String {
        format!("duration_{}_ms", self.as_str())
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts `vision` as well as the routed task name `scan.vision`.
impl FromStr for StageId {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.strip_prefix("scan.").unwrap_or(s);
        StageId::CHAIN
            .into_iter()
            .find(|stage| stage.as_str() == name)
            .ok_or_else(|| UnknownStage(s.to_string()))
    }
}

/// Static execution parameters of one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageDescriptor {
    pub id: StageId,
    pub queue: String,
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Exceeding this only logs a warning.
    pub soft_timeout: Duration,
    /// Exceeding this aborts the attempt as a transient failure.
    pub hard_timeout: Duration,
    pub message_ttl: Duration,
}

impl StageDescriptor {
    fn standard(id: StageId, soft_secs: u64, hard_secs: u64) -> Self {
        Self {
            id,
            queue: format!("scan.{}", id.as_str()),
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
            soft_timeout: Duration::from_secs(soft_secs),
            hard_timeout: Duration::from_secs(hard_secs),
            message_ttl: Duration::from_secs(10 * 60),
        }
    }
}

/// Ordered stage table.
#[derive(Debug, Clone)]
pub struct Chain {
    stages: Vec<StageDescriptor>,
}

impl Chain {
    pub fn standard() -> Self {
        Self {
            stages: vec![
                StageDescriptor::standard(StageId::Vision, 60, 90),
                StageDescriptor::standard(StageId::Rule, 20, 30),
                StageDescriptor::standard(StageId::Answer, 60, 90),
                StageDescriptor::standard(StageId::Reward, 30, 60),
            ],
        }
    }

    /// Apply `f` to every descriptor. Used to shrink delays in tests and demos.
    pub fn map_stages(mut self, f: impl Fn(&mut StageDescriptor)) -> Self {
        self.stages.iter_mut().for_each(f);
        self
    }

    pub fn descriptor(&self, id: StageId) -> &StageDescriptor {
        // stages は CHAIN と同じ順序で常に 4 件
        &self.stages[id.position()]
    }

    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }
}

impl Default for Chain {
    fn default() -> Self {
        Self::standard()
    }
}
