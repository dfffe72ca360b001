use thiserror::Error;

#[derive(Error, Debug)]
pub enum TierError {
    #[error("Backend unreachable: {backend}: {reason}")]
    BackendUnreachable { backend: String, reason: String },

    #[error("Connection pool exhausted for backend {backend} after {waited_ms}ms")]
    PoolExhausted { backend: String, waited_ms: u64 },

    #[error("Catalog conflict on partition {partition}: expected {expected}, found {found}")]
    CatalogConflict {
        partition: String,
        expected: String,
        found: String,
    },

    #[error("Verification failed for partition {partition}: {detail}")]
    VerificationFailed { partition: String, detail: String },

    #[error("Migration target unreachable: {backend}: {reason}")]
    TargetUnreachable { backend: String, reason: String },

    #[error("Partition not found: {0}")]
    PartitionNotFound(String),

    #[error("Backend not found: {0}")]
    BackendNotFound(String),

    #[error("Backend already registered: {0}")]
    BackendAlreadyRegistered(String),

    #[error("No migration found for partition {0}")]
    MigrationNotFound(String),

    #[error("Migration rejected: {0}")]
    MigrationRejected(String),

    #[error("Partition {partition} is paused for cutover; write rejected after {waited_ms}ms")]
    PartitionPaused { partition: String, waited_ms: u64 },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid row: {0}")]
    InvalidRow(String),

    #[error("Catalog invariant violated: {0}")]
    CatalogInvariant(String),

    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TierError {
    pub fn unreachable(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        TierError::BackendUnreachable {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    /// Only network-class failures are retried; pool pressure and catalog
    /// conflicts are surfaced to the caller immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TierError::BackendUnreachable { .. })
    }

    /// Whether the error indicates the backend session itself is suspect and
    /// must not be handed out again.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            TierError::BackendUnreachable { .. } | TierError::Storage(_) | TierError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TierError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(TierError::unreachable("archive-a", "connection reset").is_retryable());
        assert!(!TierError::PoolExhausted {
            backend: "primary".into(),
            waited_ms: 10
        }
        .is_retryable());
        assert!(!TierError::CatalogConflict {
            partition: "p1".into(),
            expected: "active".into(),
            found: "migrating".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = TierError::VerificationFailed {
            partition: "p2".into(),
            detail: "row count 10 != 9".into(),
        };
        assert_eq!(
            err.to_string(),
            "Verification failed for partition p2: row count 10 != 9"
        );
    }
}
