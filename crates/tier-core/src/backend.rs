//! Backend Adapter interface
//!
//! Every storage tier is reached through a [`BackendAdapter`], which hands
//! out [`BackendSession`]s. The federation layer pools sessions; it never
//! talks to a store any other way.

use crate::error::Result;
use crate::fragment::{Fragment, FragmentResult};
use crate::range::KeyRange;
use crate::types::Row;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackendId(pub String);

impl BackendId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BackendId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    Remote,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKind::Local => write!(f, "local"),
            StorageKind::Remote => write!(f, "remote"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendCapabilities {
    pub supports_pushdown_aggregation: bool,
    pub supports_ordered_scan: bool,
}

impl BackendCapabilities {
    pub fn full() -> Self {
        Self {
            supports_pushdown_aggregation: true,
            supports_ordered_scan: true,
        }
    }
}

/// Handle identifying one backend: where it is and what it can do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendRef {
    pub id: BackendId,
    pub address: String,
    /// Credentials token, never persisted.
    #[serde(skip)]
    pub auth_token: Option<String>,
    pub kind: StorageKind,
    pub capabilities: BackendCapabilities,
}

impl BackendRef {
    pub fn new(
        id: impl Into<String>,
        address: impl Into<String>,
        kind: StorageKind,
        capabilities: BackendCapabilities,
    ) -> Self {
        Self {
            id: BackendId::new(id),
            address: address.into(),
            auth_token: None,
            kind,
            capabilities,
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

/// Row count plus an order-independent hash of a key range's contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeChecksum {
    pub row_count: u64,
    pub row_hash: u64,
}

impl RangeChecksum {
    pub fn add_row(&mut self, row: &Row) {
        let mut hasher = DefaultHasher::new();
        row.hash(&mut hasher);
        self.row_hash = self.row_hash.wrapping_add(hasher.finish());
        self.row_count += 1;
    }

    pub fn of_rows<'a>(rows: impl IntoIterator<Item = &'a Row>) -> Self {
        let mut checksum = Self::default();
        for row in rows {
            checksum.add_row(row);
        }
        checksum
    }
}

impl fmt::Display for RangeChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rows={} hash={:016x}", self.row_count, self.row_hash)
    }
}

/// Factory for sessions against one physical store.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn backend_ref(&self) -> &BackendRef;

    fn capabilities(&self) -> BackendCapabilities {
        self.backend_ref().capabilities
    }

    /// Open a new session. Called by the connection pool only.
    async fn connect(&self) -> Result<Box<dyn BackendSession>>;
}

/// One live session with a backend.
#[async_trait]
pub trait BackendSession: Send {
    /// Execute a fragment, giving up at `deadline`. Fragments are read-only,
    /// so re-executing one after a timeout returns the same result.
    async fn execute(&mut self, fragment: &Fragment, deadline: Instant) -> Result<FragmentResult>;

    /// Cheap liveness round trip.
    async fn health_check(&mut self) -> Result<()>;

    /// Store rows whose keys all fall in `range`. Returns rows written.
    async fn ingest(&mut self, range: KeyRange, rows: Vec<Row>) -> Result<u64>;

    async fn checksum(&mut self, range: KeyRange) -> Result<RangeChecksum>;

    /// Delete every row in `range`. Returns rows removed.
    async fn purge(&mut self, range: KeyRange) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    #[test]
    fn test_checksum_is_order_independent() {
        let a = vec![Value::Int64(1), Value::from("x")];
        let b = vec![Value::Int64(2), Value::from("y")];

        let forward = RangeChecksum::of_rows([&a, &b]);
        let backward = RangeChecksum::of_rows([&b, &a]);
        assert_eq!(forward, backward);
        assert_eq!(forward.row_count, 2);

        let partial = RangeChecksum::of_rows([&a]);
        assert_ne!(forward.row_hash, partial.row_hash);
    }

    #[test]
    fn test_auth_token_not_serialized() {
        let backend = BackendRef::new(
            "primary",
            "mem://primary",
            StorageKind::Local,
            BackendCapabilities::full(),
        )
        .with_auth_token("s3cr3t");

        let json = serde_json::to_string(&backend).unwrap();
        assert!(!json.contains("s3cr3t"));

        let restored: BackendRef = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.auth_token, None);
        assert_eq!(restored.id, backend.id);
    }
}
