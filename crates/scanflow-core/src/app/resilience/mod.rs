//! Retry, circuit breaking, and the resilient downstream client.

pub mod circuit_breaker;
pub mod retry;
pub mod rpc_client;

pub use self::circuit_breaker::{CallPermit, CircuitBreaker, CircuitState};
pub use self::retry::RetryPolicy;
pub use self::rpc_client::{ResilientRewardClient, SyncResult};
