//! Fault tolerance for federated execution
//!
//! Provides retry backoff for fragments and failure tracking per backend.

use crate::config::RetryConfig;
use dashmap::DashMap;
use serde::Serialize;
use std::time::{Duration, Instant};
use tier_core::BackendId;

/// Exponential backoff schedule for fragment retries
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Delay before attempt number `attempt` (1-based; attempt 1 is never
    /// delayed)
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2) as i32;
        let millis = self.config.initial_backoff_ms as f64
            * self.config.backoff_multiplier.max(1.0).powi(exponent);
        Duration::from_millis(millis.min(self.config.max_backoff_ms as f64) as u64)
    }
}

/// Failure history of one backend
#[derive(Debug, Clone)]
pub struct BackendFailure {
    /// Consecutive failure count
    pub consecutive_failures: u32,
    /// Total failures
    pub total_failures: u64,
    /// Last failure time
    pub last_failure: Option<Instant>,
    /// Last failure reason
    pub last_error: Option<String>,
}

/// Health summary reported for a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendHealth {
    pub backend: BackendId,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub last_error: Option<String>,
}

/// Tracks consecutive failures per backend
#[derive(Debug)]
pub struct FaultTracker {
    failures: DashMap<BackendId, BackendFailure>,
    threshold: u32,
}

impl FaultTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            failures: DashMap::new(),
            threshold: threshold.max(1),
        }
    }

    /// Record a failure and return the backend's consecutive failure count
    pub fn record_failure(&self, backend: &BackendId, reason: &str) -> u32 {
        let mut entry = self
            .failures
            .entry(backend.clone())
            .or_insert_with(|| BackendFailure {
                consecutive_failures: 0,
                total_failures: 0,
                last_failure: None,
                last_error: None,
            });

        entry.consecutive_failures += 1;
        entry.total_failures += 1;
        entry.last_failure = Some(Instant::now());
        entry.last_error = Some(reason.to_string());

        if entry.consecutive_failures == self.threshold {
            tracing::warn!(
                "Backend {} marked unhealthy after {} consecutive failures: {}",
                backend,
                entry.consecutive_failures,
                reason
            );
        }
        entry.consecutive_failures
    }

    /// Record successful execution (resets the consecutive count)
    pub fn record_success(&self, backend: &BackendId) {
        if let Some(mut entry) = self.failures.get_mut(backend) {
            if entry.consecutive_failures >= self.threshold {
                tracing::info!("Backend {} recovered", backend);
            }
            entry.consecutive_failures = 0;
        }
    }

    pub fn is_healthy(&self, backend: &BackendId) -> bool {
        self.failures
            .get(backend)
            .map_or(true, |f| f.consecutive_failures < self.threshold)
    }

    pub fn health(&self, backend: &BackendId) -> BackendHealth {
        match self.failures.get(backend) {
            Some(failure) => BackendHealth {
                backend: backend.clone(),
                healthy: failure.consecutive_failures < self.threshold,
                consecutive_failures: failure.consecutive_failures,
                total_failures: failure.total_failures,
                last_error: failure.last_error.clone(),
            },
            None => BackendHealth {
                backend: backend.clone(),
                healthy: true,
                consecutive_failures: 0,
                total_failures: 0,
                last_error: None,
            },
        }
    }

    /// Backends at or above the failure threshold
    pub fn unhealthy_backends(&self) -> Vec<BackendId> {
        let mut unhealthy: Vec<BackendId> = self
            .failures
            .iter()
            .filter(|e| e.consecutive_failures >= self.threshold)
            .map(|e| e.key().clone())
            .collect();
        unhealthy.sort();
        unhealthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 350,
            backoff_multiplier: 2.0,
            failure_threshold: 3,
        });

        assert_eq!(policy.backoff(1), Duration::ZERO);
        assert_eq!(policy.backoff(2), Duration::from_millis(100));
        assert_eq!(policy.backoff(3), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(350));
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        let policy = RetryPolicy::new(RetryConfig::default().with_max_attempts(0));
        assert_eq!(policy.max_attempts(), 1);
    }

    #[test]
    fn test_failure_threshold() {
        let tracker = FaultTracker::new(2);
        let backend = BackendId::from("archive-a");

        assert!(tracker.is_healthy(&backend));
        tracker.record_failure(&backend, "timeout");
        assert!(tracker.is_healthy(&backend));
        assert_eq!(tracker.record_failure(&backend, "timeout"), 2);
        assert!(!tracker.is_healthy(&backend));
        assert_eq!(tracker.unhealthy_backends(), vec![backend.clone()]);

        tracker.record_success(&backend);
        let health = tracker.health(&backend);
        assert!(health.healthy);
        assert_eq!(health.total_failures, 2);
        assert_eq!(health.last_error.as_deref(), Some("timeout"));
    }
}
