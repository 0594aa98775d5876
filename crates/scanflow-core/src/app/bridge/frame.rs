//! Server-sent event frames.

use serde_json::{Value, json};

use super::progress::{ProgressStatus, ProgressUpdate};
use crate::domain::RunId;

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Data { id: u64, body: Value, terminal: bool },
    /// Comment line. Keeps idle proxies from closing the connection.
    KeepAlive,
}

impl Frame {
    pub fn connected(id: u64, run_id: RunId) -> Self {
        Frame::Data {
            id,
            body: json!({"status": "connected", "task_id": run_id}),
            terminal: false,
        }
    }

    pub fn progress(id: u64, run_id: RunId, update: &ProgressUpdate) -> Self {
        let mut body = json!({
            "task_id": run_id,
            "step": update.stage,
            "status": update.status,
            "progress": update.progress,
        });
        if let Some(result) = &update.result {
            body["result"] = result.clone();
        }
        if let Some(error) = &update.error {
            body["error"] = Value::String(error.clone());
        }
        Frame::Data {
            id,
            body,
            terminal: update.is_terminal(),
        }
    }

    pub fn timeout(id: u64, run_id: RunId) -> Self {
        Frame::Data {
            id,
            body: json!({"status": "timeout", "task_id": run_id}),
            terminal: true,
        }
    }

    /// The stream itself broke, not the pipeline.
    pub fn stream_failed(id: u64, run_id: RunId, progress: u8, error: &str) -> Self {
        Frame::Data {
            id,
            body: json!({
                "task_id": run_id,
                "status": ProgressStatus::Failed,
                "progress": progress,
                "error": error,
            }),
            terminal: true,
        }
    }

    pub fn id(&self) -> Option<u64> {
        match self {
            Frame::Data { id, .. } => Some(*id),
            Frame::KeepAlive => None,
        }
    }

    pub fn body(&self) -> Option<&Value> {
        match self {
            Frame::Data { body, .. } => Some(body),
            Frame::KeepAlive => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Frame::Data { terminal: true, .. })
    }

    /// `status` field, if any.
    pub fn status(&self) -> Option<&str> {
        self.body()?.get("status")?.as_str()
    }

    pub fn to_sse(&self) -> String {
        match self {
            Frame::Data { id, body, .. } => format!("id: {id}\ndata: {body}\n\n"),
            Frame::KeepAlive => ": keepalive\n\n".to_string(),
        }
    }
}
