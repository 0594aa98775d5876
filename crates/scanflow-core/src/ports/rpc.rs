//! Remote reward RPC port (a single unary call into the collection domain).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::domain::OwnerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    Internal,
    Unavailable,
}

impl RpcCode {
    /// Transient codes worth retrying.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            RpcCode::Unavailable
                | RpcCode::DeadlineExceeded
                | RpcCode::ResourceExhausted
                | RpcCode::Aborted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RpcCode::Cancelled => "CANCELLED",
            RpcCode::Unknown => "UNKNOWN",
            RpcCode::InvalidArgument => "INVALID_ARGUMENT",
            RpcCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            RpcCode::NotFound => "NOT_FOUND",
            RpcCode::AlreadyExists => "ALREADY_EXISTS",
            RpcCode::PermissionDenied => "PERMISSION_DENIED",
            RpcCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            RpcCode::FailedPrecondition => "FAILED_PRECONDITION",
            RpcCode::Aborted => "ABORTED",
            RpcCode::Internal => "INTERNAL",
            RpcCode::Unavailable => "UNAVAILABLE",
        }
    }
}

impl fmt::Display for RpcCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct RpcStatus {
    pub code: RpcCode,
    pub message: String,
}

impl RpcStatus {
    pub fn new(code: RpcCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub owner_id: OwnerId,
    pub item_code: String,
    pub item_name: String,
    pub source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncResponse {
    pub success: bool,
    pub already_owned: bool,
}

#[async_trait]
pub trait RewardRpc: Send + Sync {
    /// One network attempt. Deadlines are enforced by the caller.
    async fn sync_grant(&self, request: &SyncRequest) -> Result<SyncResponse, RpcStatus>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(RpcCode::Unavailable, true)]
    #[case(RpcCode::DeadlineExceeded, true)]
    #[case(RpcCode::ResourceExhausted, true)]
    #[case(RpcCode::Aborted, true)]
    #[case(RpcCode::InvalidArgument, false)]
    #[case(RpcCode::Internal, false)]
    #[case(RpcCode::NotFound, false)]
    fn retry_allowlist(#[case] code: RpcCode, #[case] retryable: bool) {
        assert_eq!(code.is_retryable(), retryable);
    }
}
