//! Per-run frame cache for `Last-Event-ID` resume.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use super::frame::Frame;
use super::progress::ProgressUpdate;
use crate::domain::RunId;

#[derive(Debug, Clone)]
pub struct CachedFrame {
    pub frame: Frame,
    /// Present for progress frames, so a resumed stream can rebuild its tracker.
    pub update: Option<ProgressUpdate>,
}

struct Entry {
    frames: Vec<CachedFrame>,
    expires_at: Instant,
}

pub struct FrameCache {
    ttl: Duration,
    runs: Mutex<HashMap<RunId, Entry>>,
}

impl FrameCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Refreshes the run's TTL.
    pub fn append(&self, run_id: RunId, frame: Frame, update: Option<ProgressUpdate>) {
        let now = Instant::now();
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        runs.retain(|_, entry| entry.expires_at > now);
        let entry = runs.entry(run_id).or_insert_with(|| Entry {
            frames: Vec::new(),
            expires_at: now,
        });
        entry.expires_at = now + self.ttl;
        entry.frames.push(CachedFrame { frame, update });
    }

    /// Frames with an id greater than `last_event_id`, oldest first.
    pub fn replay_after(&self, run_id: RunId, last_event_id: u64) -> Vec<CachedFrame> {
        self.live(run_id, |frames| {
            frames
                .iter()
                .filter(|c| c.frame.id().is_some_and(|id| id > last_event_id))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
    }

    /// Every cached frame up to and including `last_event_id`.
    pub fn delivered(&self, run_id: RunId, last_event_id: u64) -> Vec<CachedFrame> {
        self.live(run_id, |frames| {
            frames
                .iter()
                .filter(|c| c.frame.id().is_some_and(|id| id <= last_event_id))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
    }

    pub fn last_id(&self, run_id: RunId) -> u64 {
        self.live(run_id, |frames| frames.iter().filter_map(|c| c.frame.id()).max())
            .flatten()
            .unwrap_or(0)
    }

    fn live<T>(&self, run_id: RunId, f: impl FnOnce(&[CachedFrame]) -> T) -> Option<T> {
        let runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        runs.get(&run_id)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| f(&entry.frames))
    }
}
