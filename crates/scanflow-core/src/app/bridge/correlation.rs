//! Attributes lifecycle events to one run.
//!
//! An event belongs to the run when its root or task id is the run id, or when
//! its task or parent id is a task already seen for this run. Stage names are
//! cached per task because some event types omit them.

use std::collections::{HashMap, HashSet};

use crate::domain::{BridgeError, RunId, StageEvent, StageId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribution {
    /// Some other run's event.
    Foreign,
    Matched(StageId),
}

#[derive(Debug)]
pub struct Correlator {
    run_id: RunId,
    known_task_ids: HashSet<TaskId>,
    stage_by_task: HashMap<TaskId, StageId>,
}

impl Correlator {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            known_task_ids: HashSet::from([run_id]),
            stage_by_task: HashMap::new(),
        }
    }

    fn belongs(&self, event: &StageEvent) -> bool {
        event.root_id == Some(self.run_id)
            || event.task_id == self.run_id
            || self.known_task_ids.contains(&event.task_id)
            || event
                .parent_id
                .is_some_and(|parent| self.known_task_ids.contains(&parent))
    }

    pub fn attribute(&mut self, event: &StageEvent) -> Result<Attribution, BridgeError> {
        if !self.belongs(event) {
            return Ok(Attribution::Foreign);
        }
        self.known_task_ids.insert(event.task_id);

        let stage = match event.stage_name.as_deref() {
            Some(name) => {
                let stage: StageId = name.parse().map_err(|_| BridgeError::CorrelationLost {
                    task_id: event.task_id,
                    reason: format!("unknown stage name {name:?}"),
                })?;
                self.stage_by_task.insert(event.task_id, stage);
                stage
            }
            None => *self.stage_by_task.get(&event.task_id).ok_or_else(|| {
                BridgeError::CorrelationLost {
                    task_id: event.task_id,
                    reason: format!("{:?} event without a stage name for an unseen task", event.event_type),
                }
            })?,
        };
        Ok(Attribution::Matched(stage))
    }

    pub fn known_tasks(&self) -> usize {
        self.known_task_ids.len()
    }
}
