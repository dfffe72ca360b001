//! Catalog persistence
//!
//! The catalog survives restarts as an ordered list of partition records in
//! JSON. Backend credentials are never written out.

use crate::catalog::{CatalogSnapshot, PartitionDescriptor};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tier_core::{BackendRef, Result};
use tracing::debug;

/// On-disk form of a catalog snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedCatalog {
    pub version: u64,
    pub next_partition_id: u64,
    pub backends: Vec<BackendRef>,
    /// Routed partitions ordered by range start
    pub partitions: Vec<PartitionDescriptor>,
    #[serde(default)]
    pub retired: Vec<PartitionDescriptor>,
}

impl PersistedCatalog {
    /// Validate and rebuild the in-memory snapshot
    pub fn into_snapshot(self) -> Result<CatalogSnapshot> {
        CatalogSnapshot::from_parts(
            self.version,
            self.next_partition_id,
            self.backends,
            self.partitions,
            self.retired,
        )
    }

    pub fn from_snapshot(snapshot: &CatalogSnapshot) -> Self {
        snapshot.to_persisted()
    }
}

/// Durable storage for the catalog
pub trait CatalogStore: Send + Sync {
    /// Load the last saved catalog, if any
    fn load(&self) -> Result<Option<PersistedCatalog>>;

    /// Durably replace the saved catalog
    fn save(&self, catalog: &PersistedCatalog) -> Result<()>;
}

/// Catalog stored as a JSON file, replaced atomically on every save
#[derive(Debug)]
pub struct JsonCatalogStore {
    path: PathBuf,
}

impl JsonCatalogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl CatalogStore for JsonCatalogStore {
    fn load(&self) -> Result<Option<PersistedCatalog>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn save(&self, catalog: &PersistedCatalog) -> Result<()> {
        let temp = self.temp_path();
        let content = serde_json::to_string_pretty(catalog)?;
        fs::write(&temp, content)?;
        // rename is atomic on the same filesystem: readers see old or new, never half
        fs::rename(&temp, &self.path)?;
        debug!(
            "Persisted catalog v{} to {}",
            catalog.version,
            self.path.display()
        );
        Ok(())
    }
}

/// Catalog store kept in memory, for tests and ephemeral relations
#[derive(Debug, Default)]
pub struct MemoryCatalogStore {
    saved: Mutex<Option<PersistedCatalog>>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of the last saved version, if any
    pub fn saved_version(&self) -> Option<u64> {
        self.saved.lock().as_ref().map(|c| c.version)
    }
}

impl CatalogStore for MemoryCatalogStore {
    fn load(&self) -> Result<Option<PersistedCatalog>> {
        Ok(self.saved.lock().clone())
    }

    fn save(&self, catalog: &PersistedCatalog) -> Result<()> {
        *self.saved.lock() = Some(catalog.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, PartitionState, Transition};
    use std::sync::Arc;
    use tier_core::{BackendCapabilities, KeyRange, PartitionId, StorageKind, TierError};

    fn snapshot() -> CatalogSnapshot {
        let archive = BackendRef::new(
            "archive",
            "s3://cold/events",
            StorageKind::Remote,
            BackendCapabilities::default(),
        )
        .with_auth_token("cold-secret");
        let primary = BackendRef::new(
            "primary",
            "pg://hot/events",
            StorageKind::Local,
            BackendCapabilities::full(),
        );
        CatalogSnapshot::new(
            vec![archive.clone(), primary.clone()],
            vec![
                PartitionDescriptor::new(0, KeyRange::below(100), &archive),
                PartitionDescriptor::new(1, KeyRange::at_least(100), &primary),
            ],
        )
        .unwrap()
    }

    fn temp_file() -> PathBuf {
        std::env::temp_dir().join(format!("tier-catalog-{}.json", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_json_store_survives_restart() {
        let path = temp_file();
        let store = Arc::new(JsonCatalogStore::new(&path));

        let catalog = Catalog::create(snapshot(), store.clone()).unwrap();
        catalog
            .apply_transition(
                PartitionId(0),
                PartitionState::Active,
                Transition::to(PartitionState::Migrating),
            )
            .unwrap();

        // The migration did not survive the restart; p0 is routable again
        let reopened = Catalog::open(Arc::new(JsonCatalogStore::new(&path))).unwrap();
        let snapshot = reopened.snapshot();
        assert_eq!(snapshot.version(), 2);
        let partition = snapshot.partition(PartitionId(0)).unwrap();
        assert_eq!(partition.state, PartitionState::Active);
        assert_eq!(partition.backend.as_str(), "archive");
        let saved = JsonCatalogStore::new(&path).load().unwrap().unwrap();
        assert_eq!(saved.version, 2);
        assert_eq!(
            snapshot.partitions()[0].range,
            KeyRange::below(100),
            "bounds must round-trip exactly"
        );

        let raw = fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("cold-secret"));
        assert!(!store.temp_path().exists());
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_corrupt_catalog_rejected_on_load() {
        let path = temp_file();
        let mut persisted = PersistedCatalog::from_snapshot(&snapshot());
        persisted.partitions[1].range = KeyRange::at_least(150);
        JsonCatalogStore::new(&path).save(&persisted).unwrap();

        let result = Catalog::open(Arc::new(JsonCatalogStore::new(&path)));
        assert!(matches!(result, Err(TierError::CatalogInvariant(_))));
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_missing_catalog() {
        let store = JsonCatalogStore::new(temp_file());
        assert!(store.load().unwrap().is_none());
        assert!(Catalog::open(Arc::new(MemoryCatalogStore::new())).is_err());
    }
}
