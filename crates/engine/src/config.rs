//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::EngineError;

/// Tuning knobs for the engine and its caches. Every field has a default,
/// so `EngineConfig::default()` (or `{}` in JSON) is a usable configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of cached definitions.
    pub definition_cache_max_size: usize,
    /// Seconds since last access before a cached definition expires.
    pub definition_cache_ttl_secs: u64,
    /// Maximum number of cached instances.
    pub instance_cache_max_size: usize,
    /// Seconds since last access before a cached instance expires.
    pub instance_cache_ttl_secs: u64,
    /// Upper bound on instances executing at the same time.
    pub max_concurrent_instances: usize,
    /// Retries for a node that failed with a retryable error.
    pub max_dispatch_retries: u32,
    /// Base delay of the exponential retry back-off.
    pub dispatch_retry_backoff_ms: u64,
    /// Lifetime of remembered node results.
    pub idempotency_key_ttl_secs: u64,
    /// Default per-node timeout.
    pub node_timeout_secs: u64,
    /// How often a paused instance is re-checked by the executor.
    pub pause_poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            definition_cache_max_size: 1_000,
            definition_cache_ttl_secs: 3_600,
            instance_cache_max_size: 10_000,
            instance_cache_ttl_secs: 1_800,
            max_concurrent_instances: 100,
            max_dispatch_retries: 3,
            dispatch_retry_backoff_ms: 100,
            idempotency_key_ttl_secs: 3_600,
            node_timeout_secs: 300,
            pause_poll_interval_ms: 50,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        let checks = [
            (self.definition_cache_max_size, "definition_cache_max_size"),
            (self.instance_cache_max_size, "instance_cache_max_size"),
            (self.max_concurrent_instances, "max_concurrent_instances"),
        ];
        for (value, name) in checks {
            if value == 0 {
                return Err(EngineError::InvalidConfig(format!("{name} must be at least 1")));
            }
        }
        if self.node_timeout_secs == 0 {
            return Err(EngineError::InvalidConfig("node_timeout_secs must be at least 1".into()));
        }
        if self.pause_poll_interval_ms == 0 {
            return Err(EngineError::InvalidConfig(
                "pause_poll_interval_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn definition_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.definition_cache_ttl_secs)
    }

    pub fn instance_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.instance_cache_ttl_secs)
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_retries: self.max_dispatch_retries,
            retry_base_delay: Duration::from_millis(self.dispatch_retry_backoff_ms),
            node_timeout: Duration::from_secs(self.node_timeout_secs),
            idempotency_ttl: Duration::from_secs(self.idempotency_key_ttl_secs),
            pause_poll_interval: Duration::from_millis(self.pause_poll_interval_ms),
        }
    }
}

/// Tuning knobs for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum number of times a retryable node failure will be retried.
    pub max_retries: u32,
    /// Base delay for exponential back-off between retries.
    pub retry_base_delay: Duration,
    /// Applied to nodes without their own `timeout_ms`.
    pub node_timeout: Duration,
    pub idempotency_ttl: Duration,
    pub pause_poll_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        EngineConfig::default().executor_config()
    }
}
