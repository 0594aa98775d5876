//! ProgressTracker - lifecycle event から progress update を導出する純粋な状態機械
//!
//! # 不変条件
//! - stage N の `started` より前に stage N-1 の `completed` が必ず出る（無ければ合成する）
//! - 同じ stage の `started` / `completed` は 1 回だけ
//! - 最終ステージの `completed` は `result` が来た時（または grace 切れ）にだけ出る
//! - 終端 update の後は何も出さない

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::StageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Started,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub stage: StageId,
    pub status: ProgressStatus,
    pub progress: u8,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl ProgressUpdate {
    fn started(stage: StageId) -> Self {
        Self {
            stage,
            status: ProgressStatus::Started,
            progress: stage.progress().1,
            result: None,
            error: None,
        }
    }

    fn completed(stage: StageId) -> Self {
        Self {
            stage,
            status: ProgressStatus::Completed,
            progress: stage.progress().0,
            result: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self.status {
            ProgressStatus::Failed => true,
            ProgressStatus::Completed => self.stage.is_final(),
            ProgressStatus::Started => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct ProgressTracker {
    started: HashSet<StageId>,
    completed: HashSet<StageId>,
    awaiting_result: bool,
    finished: bool,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Final stage reported success but its `result` has not arrived yet.
    pub fn awaiting_result(&self) -> bool {
        self.awaiting_result && !self.finished
    }

    /// Re-apply an update that was already delivered (stream resume).
    pub fn seed(&mut self, update: &ProgressUpdate) {
        match update.status {
            ProgressStatus::Started => {
                self.started.insert(update.stage);
            }
            ProgressStatus::Completed => {
                self.started.insert(update.stage);
                self.completed.insert(update.stage);
            }
            ProgressStatus::Failed => {}
        }
        if update.is_terminal() {
            self.finished = true;
        }
    }

    fn close_predecessors(&mut self, stage: StageId, out: &mut Vec<ProgressUpdate>) {
        for &earlier in stage.predecessors() {
            if self.completed.insert(earlier) {
                self.started.insert(earlier);
                out.push(ProgressUpdate::completed(earlier));
            }
        }
    }

    pub fn on_started(&mut self, stage: StageId) -> Vec<ProgressUpdate> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        self.close_predecessors(stage, &mut out);
        if self.started.insert(stage) {
            out.push(ProgressUpdate::started(stage));
        }
        out
    }

    pub fn on_succeeded(&mut self, stage: StageId) -> Vec<ProgressUpdate> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        self.close_predecessors(stage, &mut out);
        self.started.insert(stage);
        if stage.is_final() {
            self.awaiting_result = true;
        } else if self.completed.insert(stage) {
            out.push(ProgressUpdate::completed(stage));
        }
        out
    }

    /// Terminal `completed` for the final stage. `None` when the payload was unusable
    /// or never arrived.
    pub fn on_result(&mut self, result: Option<Value>) -> Vec<ProgressUpdate> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        let last = StageId::CHAIN[StageId::CHAIN.len() - 1];
        self.close_predecessors(last, &mut out);
        self.completed.insert(last);
        self.finished = true;
        out.push(ProgressUpdate {
            result: Some(result.unwrap_or(Value::Null)),
            ..ProgressUpdate::completed(last)
        });
        out
    }

    /// Terminal failure, reported at the stage's previous progress value.
    pub fn on_failed(&mut self, stage: StageId, error: String) -> Vec<ProgressUpdate> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        vec![ProgressUpdate {
            stage,
            status: ProgressStatus::Failed,
            progress: stage.progress().1,
            result: None,
            error: Some(error),
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn summary(updates: &[ProgressUpdate]) -> Vec<(StageId, ProgressStatus, u8)> {
        updates.iter().map(|u| (u.stage, u.status, u.progress)).collect()
    }

    #[test]
    fn in_order_chain_alternates() {
        use ProgressStatus::*;
        let mut tracker = ProgressTracker::new();
        let mut all = Vec::new();
        for stage in StageId::CHAIN {
            all.extend(tracker.on_started(stage));
            all.extend(tracker.on_succeeded(stage));
        }
        all.extend(tracker.on_result(Some(json!({"ok": true}))));

        assert_eq!(
            summary(&all),
            vec![
                (StageId::Vision, Started, 0),
                (StageId::Vision, Completed, 25),
                (StageId::Rule, Started, 25),
                (StageId::Rule, Completed, 50),
                (StageId::Answer, Started, 50),
                (StageId::Answer, Completed, 75),
                (StageId::Reward, Started, 75),
                (StageId::Reward, Completed, 100),
            ]
        );
        assert!(all.last().unwrap().is_terminal());
        assert_eq!(all.last().unwrap().result, Some(json!({"ok": true})));
    }

    #[test]
    fn missing_success_is_synthesized_before_next_start() {
        let mut tracker = ProgressTracker::new();
        tracker.on_started(StageId::Vision);

        let updates = tracker.on_started(StageId::Answer);
        assert_eq!(
            summary(&updates),
            vec![
                (StageId::Vision, ProgressStatus::Completed, 25),
                (StageId::Rule, ProgressStatus::Completed, 50),
                (StageId::Answer, ProgressStatus::Started, 50),
            ]
        );

        // late success for a synthesized stage is suppressed
        assert!(tracker.on_succeeded(StageId::Rule).is_empty());
    }

    #[test]
    fn duplicates_are_suppressed() {
        let mut tracker = ProgressTracker::new();
        assert_eq!(tracker.on_started(StageId::Vision).len(), 1);
        assert!(tracker.on_started(StageId::Vision).is_empty());
        assert_eq!(tracker.on_succeeded(StageId::Vision).len(), 1);
        assert!(tracker.on_succeeded(StageId::Vision).is_empty());
    }

    #[test]
    fn final_success_waits_for_result() {
        let mut tracker = ProgressTracker::new();
        tracker.on_started(StageId::Reward);
        assert!(tracker.on_succeeded(StageId::Reward).is_empty());
        assert!(tracker.awaiting_result());

        let updates = tracker.on_result(None);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].result, Some(Value::Null));
        assert!(!tracker.awaiting_result());
    }

    #[test]
    fn failure_is_terminal_at_previous_progress() {
        let mut tracker = ProgressTracker::new();
        tracker.on_started(StageId::Vision);
        tracker.on_succeeded(StageId::Vision);

        let updates = tracker.on_failed(StageId::Rule, "rules db down".into());
        assert_eq!(summary(&updates), vec![(StageId::Rule, ProgressStatus::Failed, 25)]);
        assert!(updates[0].is_terminal());

        assert!(tracker.on_started(StageId::Answer).is_empty());
        assert!(tracker.on_result(None).is_empty());
        assert!(tracker.on_failed(StageId::Answer, "again".into()).is_empty());
    }

    #[test]
    fn seeded_tracker_does_not_repeat_delivered_updates() {
        let mut tracker = ProgressTracker::new();
        tracker.seed(&ProgressUpdate::started(StageId::Vision));
        tracker.seed(&ProgressUpdate::completed(StageId::Vision));

        let updates = tracker.on_started(StageId::Rule);
        assert_eq!(summary(&updates), vec![(StageId::Rule, ProgressStatus::Started, 25)]);
    }
}
