//! Federation configuration
//!
//! All durations are configured in integer milliseconds so the JSON form
//! stays readable; each config exposes `Duration` accessors.

use crate::types::FailurePolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tier_core::Result;

/// Per-backend connection pool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum sessions open at once per backend
    pub max_size: usize,
    /// Idle sessions kept open regardless of idle time
    pub min_idle: usize,
    /// How long `acquire` waits for a free slot
    pub acquire_timeout_ms: u64,
    /// Idle sessions above `min_idle` are closed after this long
    pub idle_timeout_ms: u64,
    /// Timeout for the liveness probe before reuse
    pub health_check_timeout_ms: u64,
    /// Timeout for opening a new session
    pub connect_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 8,
            min_idle: 1,
            acquire_timeout_ms: 2000,
            idle_timeout_ms: 60_000, // 1 minute
            health_check_timeout_ms: 500,
            connect_timeout_ms: 2000,
        }
    }
}

impl PoolConfig {
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_min_idle(mut self, min_idle: usize) -> Self {
        self.min_idle = min_idle;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Fan-out executor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Overall query deadline when the caller gives none
    pub default_timeout_ms: u64,
    /// Upper bound for a single fragment attempt
    pub attempt_timeout_ms: u64,
    /// Fragments kept in flight ahead of the merge cursor for ordered
    /// top-N queries
    pub ordered_prefetch: usize,
    /// Failure policy when the caller gives none
    pub default_policy: FailurePolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000, // 30 seconds
            attempt_timeout_ms: 10_000,
            ordered_prefetch: 1,
            default_policy: FailurePolicy::FailFast,
        }
    }
}

impl ExecutorConfig {
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_ordered_prefetch(mut self, prefetch: usize) -> Self {
        self.ordered_prefetch = prefetch;
        self
    }

    pub fn with_default_policy(mut self, policy: FailurePolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

/// Retry and backend failure tracking settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per fragment, including the first
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// Consecutive failures after which a backend is reported unhealthy
    pub failure_threshold: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 1000,
            backoff_multiplier: 2.0,
            failure_threshold: 3,
        }
    }
}

impl RetryConfig {
    /// No retries at all
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff_ms = backoff.as_millis() as u64;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }
}

/// Migration orchestrator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Rows moved per copy step
    pub copy_batch_rows: usize,
    /// Longest cutover waits for in-flight writes on the partition to drain
    pub cutover_pause_timeout_ms: u64,
    /// How long source data is retained after cutover before removal
    pub decommission_grace_ms: u64,
    /// Deadline for each backend operation issued by the orchestrator
    pub operation_timeout_ms: u64,
    /// Pause between steps when a migration runs in the background
    pub step_delay_ms: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            copy_batch_rows: 10_000,
            cutover_pause_timeout_ms: 500,
            decommission_grace_ms: 0,
            operation_timeout_ms: 30_000,
            step_delay_ms: 0,
        }
    }
}

impl MigrationConfig {
    pub fn with_copy_batch_rows(mut self, rows: usize) -> Self {
        self.copy_batch_rows = rows;
        self
    }

    pub fn with_cutover_pause_timeout(mut self, timeout: Duration) -> Self {
        self.cutover_pause_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_decommission_grace(mut self, grace: Duration) -> Self {
        self.decommission_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn cutover_pause_timeout(&self) -> Duration {
        Duration::from_millis(self.cutover_pause_timeout_ms)
    }

    pub fn decommission_grace(&self) -> Duration {
        Duration::from_millis(self.decommission_grace_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }
}

/// Top-level configuration for a federated relation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    pub pool: PoolConfig,
    pub executor: ExecutorConfig,
    pub retry: RetryConfig,
    pub migration: MigrationConfig,
    /// Longest a write waits on a partition paused for cutover before it is
    /// rejected
    pub write_timeout_ms: u64,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            executor: ExecutorConfig::default(),
            retry: RetryConfig::default(),
            migration: MigrationConfig::default(),
            write_timeout_ms: 1000,
        }
    }
}

impl FederationConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_migration(mut self, migration: MigrationConfig) -> Self {
        self.migration = migration;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}
