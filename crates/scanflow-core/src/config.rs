//! Runtime configuration.
//!
//! Every group has defaults; `Config::from_env` overrides them from
//! `SCANFLOW_*` variables. Present-but-malformed values are errors.

use std::time::Duration;
use thiserror::Error;

use crate::observability::LogFormat;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{key} has invalid value {value:?}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Workers per stage queue. Each holds at most one unacked delivery.
    pub worker_concurrency: usize,
    /// How long one consume call waits before re-checking shutdown.
    pub consume_wait: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 2,
            consume_wait: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Wall-clock bound of one progress stream.
    pub stream_timeout: Duration,
    pub keepalive_interval: Duration,
    /// Bound on waiting for the listener to bind.
    pub ready_timeout: Duration,
    /// Blocking read timeout of the listener thread; bounds cancellation latency.
    pub poll_interval: Duration,
    pub channel_capacity: usize,
    /// Wait for `result` after the final stage reported success.
    pub result_grace: Duration,
    pub replay_ttl: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            stream_timeout: Duration::from_secs(120),
            keepalive_interval: Duration::from_secs(1),
            ready_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(250),
            channel_capacity: 64,
            result_grace: Duration::from_secs(5),
            replay_ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcClientConfig {
    pub fail_max: u32,
    pub open_duration: Duration,
    pub call_timeout: Duration,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            fail_max: 5,
            open_duration: Duration::from_secs(30),
            call_timeout: Duration::from_secs(5),
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxConfig {
    pub category_key: String,
    pub poll_interval: Duration,
    pub batch_size: usize,
}

impl OutboxConfig {
    /// Where unparsable entries are parked.
    pub fn dead_key(&self) -> String {
        format!("{}:dlq", self.category_key)
    }
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            category_key: "outbox:pipeline".to_string(),
            poll_interval: Duration::from_secs(1),
            batch_size: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlqConfig {
    pub interval: Duration,
    pub batch_size: usize,
    /// `retry_count >= archive_threshold` goes to the archive queue.
    pub archive_threshold: u32,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            batch_size: 10,
            archive_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardConfig {
    pub enabled: bool,
    pub eligible_category: String,
    pub persist_max_retries: u32,
    pub persist_base_delay: Duration,
    pub persist_max_delay: Duration,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            eligible_category: "recyclable".to_string(),
            persist_max_retries: 5,
            persist_base_delay: Duration::from_secs(1),
            persist_max_delay: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub log_format: LogFormat,
    pub pipeline: PipelineConfig,
    pub bridge: BridgeConfig,
    pub rpc: RpcClientConfig,
    pub outbox: OutboxConfig,
    pub dlq: DlqConfig,
    pub reward: RewardConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as `from_env` with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let mut config = Self::default();

        if let Some(format) = env.string("SCANFLOW_LOG_FORMAT") {
            config.log_format = format
                .parse()
                .map_err(|reason| invalid("SCANFLOW_LOG_FORMAT", &format, reason))?;
        }

        if let Some(n) = env.usize("SCANFLOW_WORKER_CONCURRENCY")? {
            config.pipeline.worker_concurrency = n.max(1);
        }

        if let Some(secs) = env.u64("SCANFLOW_STREAM_TIMEOUT_SECS")? {
            config.bridge.stream_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = env.u64("SCANFLOW_KEEPALIVE_MS")? {
            config.bridge.keepalive_interval = Duration::from_millis(ms);
        }
        if let Some(n) = env.usize("SCANFLOW_BRIDGE_CHANNEL_CAPACITY")? {
            config.bridge.channel_capacity = n.max(1);
        }

        if let Some(n) = env.u32("SCANFLOW_RPC_FAIL_MAX")? {
            config.rpc.fail_max = n.max(1);
        }
        if let Some(secs) = env.u64("SCANFLOW_RPC_OPEN_SECS")? {
            config.rpc.open_duration = Duration::from_secs(secs);
        }
        if let Some(ms) = env.u64("SCANFLOW_RPC_TIMEOUT_MS")? {
            config.rpc.call_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = env.u32("SCANFLOW_RPC_MAX_RETRIES")? {
            config.rpc.max_retries = n;
        }
        if let Some(ms) = env.u64("SCANFLOW_RPC_BASE_DELAY_MS")? {
            config.rpc.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env.u64("SCANFLOW_RPC_MAX_DELAY_MS")? {
            config.rpc.max_delay = Duration::from_millis(ms);
        }

        if let Some(key) = env.string("SCANFLOW_OUTBOX_KEY") {
            config.outbox.category_key = key;
        }
        if let Some(ms) = env.u64("SCANFLOW_OUTBOX_POLL_MS")? {
            config.outbox.poll_interval = Duration::from_millis(ms);
        }
        if let Some(n) = env.usize("SCANFLOW_OUTBOX_BATCH")? {
            config.outbox.batch_size = n.max(1);
        }

        if let Some(secs) = env.u64("SCANFLOW_DLQ_INTERVAL_SECS")? {
            config.dlq.interval = Duration::from_secs(secs);
        }
        if let Some(n) = env.usize("SCANFLOW_DLQ_BATCH")? {
            config.dlq.batch_size = n.max(1);
        }
        if let Some(n) = env.u32("SCANFLOW_DLQ_ARCHIVE_THRESHOLD")? {
            config.dlq.archive_threshold = n;
        }

        if let Some(enabled) = env.bool("SCANFLOW_REWARD_ENABLED")? {
            config.reward.enabled = enabled;
        }
        if let Some(category) = env.string("SCANFLOW_REWARD_CATEGORY") {
            config.reward.eligible_category = category;
        }
        if let Some(n) = env.u32("SCANFLOW_REWARD_PERSIST_MAX_RETRIES")? {
            config.reward.persist_max_retries = n;
        }

        Ok(config)
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn parsed<T>(&self, name: &str) -> Result<Option<T>, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<T>()
            .map(Some)
            .map_err(|e| invalid(name, &v, e.to_string()))
    }

    fn u64(&self, name: &str) -> Result<Option<u64>, ConfigError> {
        self.parsed(name)
    }

    fn u32(&self, name: &str) -> Result<Option<u32>, ConfigError> {
        self.parsed(name)
    }

    fn usize(&self, name: &str) -> Result<Option<usize>, ConfigError> {
        self.parsed(name)
    }

    fn bool(&self, name: &str) -> Result<Option<bool>, ConfigError> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        match v.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "y" => Ok(Some(true)),
            "false" | "0" | "no" | "n" => Ok(Some(false)),
            _ => Err(invalid(name, &v, "must be a boolean (true/false/1/0)")),
        }
    }
}

fn invalid(key: &str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}
