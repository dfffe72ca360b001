//! Core types for query federation

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a federated query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryId(pub Uuid);

impl QueryId {
    /// Create a new random query ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for QueryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "query-{}", &self.0.to_string()[..8])
    }
}

/// Unique identifier for a migration job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MigrationId(pub Uuid);

impl MigrationId {
    /// Create a new random migration ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MigrationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "migration-{}", &self.0.to_string()[..8])
    }
}

/// How a query reacts to a backend that cannot answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// First backend error aborts the whole query
    #[default]
    FailFast,
    /// Missing partitions are reported and the query completes partially
    BestEffort,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::FailFast => write!(f, "fail-fast"),
            FailurePolicy::BestEffort => write!(f, "best-effort"),
        }
    }
}

/// Per-query execution options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Failure policy; the executor default when unset
    pub policy: Option<FailurePolicy>,
    /// Overall deadline for the query; the executor default when unset
    pub timeout: Option<Duration>,
}

impl QueryOptions {
    pub fn fail_fast() -> Self {
        Self {
            policy: Some(FailurePolicy::FailFast),
            timeout: None,
        }
    }

    pub fn best_effort() -> Self {
        Self {
            policy: Some(FailurePolicy::BestEffort),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Get current time in milliseconds
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display() {
        let id = QueryId::new();
        let shown = id.to_string();
        assert!(shown.starts_with("query-"));
        assert_eq!(shown.len(), "query-".len() + 8);
        assert!(MigrationId::new().to_string().starts_with("migration-"));
    }

    #[test]
    fn test_policy_serde() {
        let json = serde_json::to_string(&FailurePolicy::BestEffort).unwrap();
        assert_eq!(json, "\"best_effort\"");
        assert_eq!(FailurePolicy::default(), FailurePolicy::FailFast);
    }
}
