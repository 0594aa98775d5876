//! Resilient wrapper around the remote reward RPC.
//!
//! Reward sync is a best-effort side channel, so this client never returns an
//! error: breaker-open and exhausted retries both come back as a negative result.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, error, warn};

use super::circuit_breaker::{CircuitBreaker, CircuitState};
use super::retry::RetryPolicy;
use crate::config::RpcClientConfig;
use crate::ports::{RewardRpc, RpcCode, RpcStatus, SyncRequest, SyncResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncResult {
    pub success: bool,
    pub already_owned: bool,
}

impl SyncResult {
    pub fn failed() -> Self {
        Self::default()
    }
}

pub struct ResilientRewardClient {
    rpc: Arc<dyn RewardRpc>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    max_retries: u32,
    call_timeout: Duration,
    network_attempts: AtomicU64,
}

impl ResilientRewardClient {
    pub fn new(rpc: Arc<dyn RewardRpc>, config: &RpcClientConfig) -> Self {
        Self {
            rpc,
            breaker: CircuitBreaker::new("reward-rpc", config.fail_max, config.open_duration),
            retry: RetryPolicy::exponential(config.base_delay, config.max_delay),
            max_retries: config.max_retries,
            call_timeout: config.call_timeout,
            network_attempts: AtomicU64::new(0),
        }
    }

    /// One logical call: a single breaker permit covering every retry.
    pub async fn sync_grant(&self, request: &SyncRequest) -> SyncResult {
        let Some(permit) = self.breaker.try_acquire() else {
            warn!(
                owner = %request.owner_id,
                item = %request.item_code,
                "downstream unavailable: circuit open, skipping call"
            );
            return SyncResult::failed();
        };

        match self.call_with_retry(request).await {
            Ok(response) => {
                permit.success();
                SyncResult {
                    success: response.success,
                    already_owned: response.already_owned,
                }
            }
            Err(status) => {
                permit.failure();
                error!(
                    owner = %request.owner_id,
                    item = %request.item_code,
                    code = %status.code,
                    error = %status.message,
                    "reward sync failed"
                );
                SyncResult::failed()
            }
        }
    }

    async fn call_with_retry(&self, request: &SyncRequest) -> Result<SyncResponse, RpcStatus> {
        let mut attempt = 0;
        loop {
            match self.call_once(request).await {
                Ok(response) => return Ok(response),
                Err(status) if status.code.is_retryable() && attempt < self.max_retries => {
                    let delay = self.retry.next_delay(attempt);
                    attempt += 1;
                    warn!(
                        code = %status.code,
                        attempt,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "retrying reward sync"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(status) => return Err(status),
            }
        }
    }

    async fn call_once(&self, request: &SyncRequest) -> Result<SyncResponse, RpcStatus> {
        self.network_attempts.fetch_add(1, Ordering::SeqCst);
        match tokio::time::timeout(self.call_timeout, self.rpc.sync_grant(request)).await {
            Ok(result) => result,
            Err(_) => {
                debug!(timeout_ms = self.call_timeout.as_millis() as u64, "reward sync timed out");
                Err(RpcStatus::new(RpcCode::DeadlineExceeded, "call timed out"))
            }
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn circuit_fail_count(&self) -> u32 {
        self.breaker.consecutive_failures()
    }

    pub fn reset_circuit(&self) {
        self.breaker.reset();
    }

    /// Total calls that reached the network, across all logical calls.
    pub fn network_attempts(&self) -> u64 {
        self.network_attempts.load(Ordering::SeqCst)
    }
}
