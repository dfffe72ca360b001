//! Partition catalog
//!
//! The authoritative ordered map from key ranges to partition descriptors.
//! Readers take an immutable [`CatalogSnapshot`] with a single atomic load
//! and never block. Writers build a new snapshot from the current one,
//! validate coverage, persist it and publish it with one pointer swap, so
//! no reader can observe a gap or an overlap.

use crate::persistence::{CatalogStore, PersistedCatalog};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tier_core::{BackendId, BackendRef, Key, KeyRange, PartitionId, Result, StorageKind, TierError};
use tracing::{debug, info, warn};

/// Lifecycle state of a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionState {
    /// Routed to its backend for reads and writes
    Active,
    /// A migration is moving it; still routed to the source backend
    Migrating,
    /// No longer part of the relation
    Retired,
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionState::Active => write!(f, "active"),
            PartitionState::Migrating => write!(f, "migrating"),
            PartitionState::Retired => write!(f, "retired"),
        }
    }
}

/// One contiguous slice of the key domain and the backend that owns it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionDescriptor {
    pub id: PartitionId,
    /// Half-open `[start, end)` bounds
    pub range: KeyRange,
    pub backend: BackendId,
    pub storage_kind: StorageKind,
    pub state: PartitionState,
    /// Catalog version at which this descriptor last changed
    pub version: u64,
}

impl PartitionDescriptor {
    pub fn new(id: u64, range: KeyRange, backend: &BackendRef) -> Self {
        Self {
            id: PartitionId(id),
            range,
            backend: backend.id.clone(),
            storage_kind: backend.kind,
            state: PartitionState::Active,
            version: 0,
        }
    }
}

/// A routing change requested through [`Catalog::apply_transition`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub state: PartitionState,
    /// New owning backend; the storage kind follows the backend
    pub backend: Option<BackendId>,
}

impl Transition {
    pub fn to(state: PartitionState) -> Self {
        Self {
            state,
            backend: None,
        }
    }

    pub fn on_backend(mut self, backend: BackendId) -> Self {
        self.backend = Some(backend);
        self
    }
}

/// Immutable view of the catalog at one version
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogSnapshot {
    version: u64,
    next_partition_id: u64,
    backends: BTreeMap<BackendId, Arc<BackendRef>>,
    /// Non-retired partitions sorted by range start
    partitions: Vec<PartitionDescriptor>,
    retired: Vec<PartitionDescriptor>,
}

impl CatalogSnapshot {
    /// Build and validate a snapshot. Partitions may be given in any order.
    pub fn new(backends: Vec<BackendRef>, partitions: Vec<PartitionDescriptor>) -> Result<Self> {
        let next_partition_id = partitions.iter().map(|p| p.id.0 + 1).max().unwrap_or(0);
        Self::from_parts(0, next_partition_id, backends, partitions, Vec::new())
    }

    pub(crate) fn from_parts(
        version: u64,
        next_partition_id: u64,
        backends: Vec<BackendRef>,
        mut partitions: Vec<PartitionDescriptor>,
        retired: Vec<PartitionDescriptor>,
    ) -> Result<Self> {
        partitions.sort_by_key(|p| p.range.lower());
        let snapshot = Self {
            version,
            next_partition_id,
            backends: backends
                .into_iter()
                .map(|b| (b.id.clone(), Arc::new(b)))
                .collect(),
            partitions,
            retired,
        };
        snapshot.validate()?;
        Ok(snapshot)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn next_partition_id(&self) -> u64 {
        self.next_partition_id
    }

    /// Non-retired partitions in key order
    pub fn partitions(&self) -> &[PartitionDescriptor] {
        &self.partitions
    }

    pub fn retired(&self) -> &[PartitionDescriptor] {
        &self.retired
    }

    pub fn backends(&self) -> impl Iterator<Item = &Arc<BackendRef>> {
        self.backends.values()
    }

    pub fn backend(&self, id: &BackendId) -> Option<Arc<BackendRef>> {
        self.backends.get(id).cloned()
    }

    pub fn partition(&self, id: PartitionId) -> Option<&PartitionDescriptor> {
        self.partitions.iter().find(|p| p.id == id)
    }

    /// Partitions overlapping `range`, in key order. Binary search over the
    /// sorted start bounds, then a linear walk over the `k` matches.
    pub fn lookup(&self, range: &KeyRange) -> Vec<&PartitionDescriptor> {
        if range.is_empty() {
            return Vec::new();
        }
        let first = self
            .partitions
            .partition_point(|p| p.range.upper() <= range.lower());
        self.partitions[first..]
            .iter()
            .take_while(|p| p.range.lower() < range.upper())
            .collect()
    }

    /// The partition whose range contains `key`
    pub fn partition_for_key(&self, key: Key) -> Option<&PartitionDescriptor> {
        let index = self
            .partitions
            .partition_point(|p| p.range.upper() <= i128::from(key));
        self.partitions.get(index).filter(|p| p.range.contains(key))
    }

    /// Check the coverage invariant: partitions are non-empty, sorted,
    /// contiguous and together span the whole key domain, each owned by a
    /// known backend.
    pub fn validate(&self) -> Result<()> {
        let (first, last) = match (self.partitions.first(), self.partitions.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => {
                return Err(TierError::CatalogInvariant(
                    "catalog has no partitions".to_string(),
                ))
            }
        };
        if first.range.start.is_some() {
            return Err(TierError::CatalogInvariant(format!(
                "keys below {} are not covered",
                first.range
            )));
        }
        if last.range.end.is_some() {
            return Err(TierError::CatalogInvariant(format!(
                "keys above {} are not covered",
                last.range
            )));
        }

        for pair in self.partitions.windows(2) {
            if !pair[0].range.adjacent_to(&pair[1].range) {
                return Err(TierError::CatalogInvariant(format!(
                    "partitions {} {} and {} {} are not contiguous",
                    pair[0].id, pair[0].range, pair[1].id, pair[1].range
                )));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for partition in self.partitions.iter().chain(&self.retired) {
            if !seen.insert(partition.id) {
                return Err(TierError::CatalogInvariant(format!(
                    "duplicate partition id {}",
                    partition.id
                )));
            }
        }

        for partition in &self.partitions {
            if partition.range.is_empty() {
                return Err(TierError::CatalogInvariant(format!(
                    "partition {} has empty range {}",
                    partition.id, partition.range
                )));
            }
            if partition.state == PartitionState::Retired {
                return Err(TierError::CatalogInvariant(format!(
                    "retired partition {} is still routed",
                    partition.id
                )));
            }
            if !self.backends.contains_key(&partition.backend) {
                return Err(TierError::BackendNotFound(partition.backend.to_string()));
            }
        }
        Ok(())
    }

    pub(crate) fn to_persisted(&self) -> PersistedCatalog {
        PersistedCatalog {
            version: self.version,
            next_partition_id: self.next_partition_id,
            backends: self.backends.values().map(|b| (**b).clone()).collect(),
            partitions: self.partitions.clone(),
            retired: self.retired.clone(),
        }
    }

    fn bump(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    fn position(&self, id: PartitionId) -> Result<usize> {
        match self.partitions.iter().position(|p| p.id == id) {
            Some(index) => Ok(index),
            None if self.retired.iter().any(|p| p.id == id) => Err(TierError::CatalogConflict {
                partition: id.to_string(),
                expected: PartitionState::Active.to_string(),
                found: PartitionState::Retired.to_string(),
            }),
            None => Err(TierError::PartitionNotFound(id.to_string())),
        }
    }

    fn expect_state(&self, index: usize, expected: PartitionState) -> Result<()> {
        let partition = &self.partitions[index];
        if partition.state != expected {
            return Err(TierError::CatalogConflict {
                partition: partition.id.to_string(),
                expected: expected.to_string(),
                found: partition.state.to_string(),
            });
        }
        Ok(())
    }
}

/// The partition catalog of one relation
pub struct Catalog {
    current: ArcSwap<CatalogSnapshot>,
    /// Serializes publishing so persisted order matches published order
    commit: Mutex<()>,
    store: Option<Arc<dyn CatalogStore>>,
}

impl Catalog {
    /// Create an in-memory catalog
    pub fn new(snapshot: CatalogSnapshot) -> Self {
        Self {
            current: ArcSwap::from_pointee(snapshot),
            commit: Mutex::new(()),
            store: None,
        }
    }

    /// Create a catalog that persists every committed change to `store`,
    /// starting with the given snapshot
    pub fn create(snapshot: CatalogSnapshot, store: Arc<dyn CatalogStore>) -> Result<Self> {
        store.save(&snapshot.to_persisted())?;
        Ok(Self {
            current: ArcSwap::from_pointee(snapshot),
            commit: Mutex::new(()),
            store: Some(store),
        })
    }

    /// Load a previously persisted catalog.
    ///
    /// Migration jobs do not outlive the process, so partitions saved as
    /// migrating are reverted to active on their source backend. Routing
    /// only moves at cutover, which leaves the source holding every row.
    pub fn open(store: Arc<dyn CatalogStore>) -> Result<Self> {
        let persisted = store.load()?.ok_or_else(|| {
            TierError::CatalogInvariant("no persisted catalog found".to_string())
        })?;
        let snapshot = persisted.into_snapshot()?;
        info!(
            "Loaded catalog version {} with {} partitions",
            snapshot.version(),
            snapshot.partitions().len()
        );
        let interrupted: Vec<PartitionId> = snapshot
            .partitions()
            .iter()
            .filter(|p| p.state == PartitionState::Migrating)
            .map(|p| p.id)
            .collect();

        let catalog = Self {
            current: ArcSwap::from_pointee(snapshot),
            commit: Mutex::new(()),
            store: Some(store),
        };
        for partition in interrupted {
            catalog.apply_transition(
                partition,
                PartitionState::Migrating,
                Transition::to(PartitionState::Active),
            )?;
            warn!(
                "Partition {} was migrating when the catalog was saved; reverted to active",
                partition
            );
        }
        Ok(catalog)
    }

    /// Take a consistent snapshot; one atomic load, never blocks
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    /// Partitions overlapping `range` in the current snapshot
    pub fn lookup(&self, range: &KeyRange) -> Vec<PartitionDescriptor> {
        self.current
            .load()
            .lookup(range)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Register a backend so partitions can be assigned to it
    pub fn register_backend(&self, backend: BackendRef) -> Result<()> {
        let id = backend.id.clone();
        self.commit_with(|snapshot| {
            if snapshot.backends.contains_key(&backend.id) {
                return Err(TierError::BackendAlreadyRegistered(backend.id.to_string()));
            }
            snapshot.backends.insert(backend.id.clone(), Arc::new(backend.clone()));
            snapshot.bump();
            Ok(())
        })?;
        info!("Registered backend {} in catalog", id);
        Ok(())
    }

    /// Replace the handle of an already registered backend, e.g. to attach
    /// credentials after loading a persisted catalog. The backend's storage
    /// kind may not change while partitions reference it.
    pub fn refresh_backend(&self, backend: BackendRef) -> Result<()> {
        self.commit_with(|snapshot| {
            let existing = snapshot
                .backends
                .get(&backend.id)
                .ok_or_else(|| TierError::BackendNotFound(backend.id.to_string()))?;
            if existing.kind != backend.kind
                && snapshot.partitions.iter().any(|p| p.backend == backend.id)
            {
                return Err(TierError::CatalogInvariant(format!(
                    "backend {} changes storage kind while owning partitions",
                    backend.id
                )));
            }
            snapshot.backends.insert(backend.id.clone(), Arc::new(backend.clone()));
            snapshot.bump();
            Ok(())
        })
    }

    /// Move a partition to a new state (and optionally a new backend) if it
    /// is currently in `expected`. Fails with `CatalogConflict` otherwise.
    pub fn apply_transition(
        &self,
        id: PartitionId,
        expected: PartitionState,
        transition: Transition,
    ) -> Result<PartitionDescriptor> {
        if transition.state == PartitionState::Retired {
            return Err(TierError::CatalogInvariant(format!(
                "partition {} can only be retired by merging it away",
                id
            )));
        }

        let updated = self.commit_with(|snapshot| {
            let index = snapshot.position(id)?;
            snapshot.expect_state(index, expected)?;

            let backend = match &transition.backend {
                Some(backend_id) => Some(
                    snapshot
                        .backend(backend_id)
                        .ok_or_else(|| TierError::BackendNotFound(backend_id.to_string()))?,
                ),
                None => None,
            };

            let version = snapshot.bump();
            let partition = &mut snapshot.partitions[index];
            partition.state = transition.state;
            if let Some(backend) = backend {
                partition.backend = backend.id.clone();
                partition.storage_kind = backend.kind;
            }
            partition.version = version;
            Ok(partition.clone())
        })?;

        debug!(
            "Partition {} {} -> {} on {} (catalog v{})",
            id, expected, updated.state, updated.backend, updated.version
        );
        Ok(updated)
    }

    /// Split an active partition at `at`, provisioning `[at, end)` as a new
    /// partition on the same backend. Returns the new partition's id.
    pub fn split_partition(&self, id: PartitionId, at: Key) -> Result<PartitionId> {
        let new_id = self.commit_with(|snapshot| {
            let index = snapshot.position(id)?;
            snapshot.expect_state(index, PartitionState::Active)?;

            let (left, right) = snapshot.partitions[index].range.split_at(at).ok_or_else(|| {
                TierError::InvalidQuery(format!(
                    "split point {} is not inside {}",
                    at, snapshot.partitions[index].range
                ))
            })?;

            let version = snapshot.bump();
            let new_id = PartitionId(snapshot.next_partition_id);
            snapshot.next_partition_id += 1;

            let mut provisioned = snapshot.partitions[index].clone();
            provisioned.id = new_id;
            provisioned.range = right;
            provisioned.version = version;

            let original = &mut snapshot.partitions[index];
            original.range = left;
            original.version = version;

            snapshot.partitions.insert(index + 1, provisioned);
            Ok(new_id)
        })?;

        info!("Split partition {} at {}, provisioned {}", id, at, new_id);
        Ok(new_id)
    }

    /// Merge `right` into its left neighbour `left`. Both must be active,
    /// adjacent and on the same backend; `right` is retired.
    pub fn merge_partitions(&self, left: PartitionId, right: PartitionId) -> Result<()> {
        self.commit_with(|snapshot| {
            let li = snapshot.position(left)?;
            let ri = snapshot.position(right)?;
            snapshot.expect_state(li, PartitionState::Active)?;
            snapshot.expect_state(ri, PartitionState::Active)?;

            if ri != li + 1 {
                return Err(TierError::InvalidQuery(format!(
                    "partitions {} and {} are not adjacent",
                    left, right
                )));
            }
            if snapshot.partitions[li].backend != snapshot.partitions[ri].backend {
                return Err(TierError::InvalidQuery(format!(
                    "partitions {} and {} live on different backends",
                    left, right
                )));
            }

            let version = snapshot.bump();
            let mut retired = snapshot.partitions.remove(ri);
            let survivor = &mut snapshot.partitions[li];
            survivor.range.end = retired.range.end;
            survivor.version = version;

            retired.state = PartitionState::Retired;
            retired.version = version;
            snapshot.retired.push(retired);
            Ok(())
        })?;

        info!("Merged partition {} into {}", right, left);
        Ok(())
    }

    /// Apply `change` to a copy of the latest snapshot, validate, persist and
    /// publish it. `change` is re-run if another writer published first.
    fn commit_with<T>(
        &self,
        mut change: impl FnMut(&mut CatalogSnapshot) -> Result<T>,
    ) -> Result<T> {
        loop {
            let base = self.current.load_full();
            let mut next = (*base).clone();
            let output = change(&mut next)?;
            next.validate()?;

            let _guard = self.commit.lock();
            if !Arc::ptr_eq(&base, &self.current.load()) {
                continue;
            }
            if let Some(store) = &self.store {
                store.save(&next.to_persisted())?;
            }
            self.current.store(Arc::new(next));
            return Ok(output);
        }
    }
}

impl fmt::Debug for Catalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.current.load();
        f.debug_struct("Catalog")
            .field("version", &snapshot.version)
            .field("partitions", &snapshot.partitions.len())
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryCatalogStore;
    use tier_core::BackendCapabilities;

    fn backend(id: &str, kind: StorageKind) -> BackendRef {
        BackendRef::new(id, format!("mem://{}", id), kind, BackendCapabilities::full())
    }

    fn tiers() -> CatalogSnapshot {
        let archive_a = backend("archive-a", StorageKind::Remote);
        let archive_b = backend("archive-b", StorageKind::Remote);
        let primary = backend("primary", StorageKind::Local);
        let partitions = vec![
            PartitionDescriptor::new(2, KeyRange::at_least(20250101), &primary),
            PartitionDescriptor::new(0, KeyRange::below(20240101), &archive_a),
            PartitionDescriptor::new(1, KeyRange::bounded(20240101, 20250101), &archive_b),
        ];
        CatalogSnapshot::new(
            vec![archive_a, archive_b, primary, backend("archive-c", StorageKind::Remote)],
            partitions,
        )
        .unwrap()
    }

    fn ids(partitions: &[&PartitionDescriptor]) -> Vec<u64> {
        partitions.iter().map(|p| p.id.0).collect()
    }

    #[test]
    fn test_lookup_is_ordered_and_exact() {
        let snapshot = tiers();
        assert_eq!(ids(&snapshot.lookup(&KeyRange::full())), vec![0, 1, 2]);
        assert_eq!(
            ids(&snapshot.lookup(&KeyRange::inclusive(20240601, 20250601))),
            vec![1, 2]
        );
        assert_eq!(ids(&snapshot.lookup(&KeyRange::point(20240101))), vec![1]);
        assert_eq!(ids(&snapshot.lookup(&KeyRange::point(20231231))), vec![0]);
        assert!(snapshot.lookup(&KeyRange::bounded(5, 5)).is_empty());
    }

    #[test]
    fn test_partition_for_key() {
        let snapshot = tiers();
        assert_eq!(snapshot.partition_for_key(i64::MIN).unwrap().id, PartitionId(0));
        assert_eq!(snapshot.partition_for_key(20241231).unwrap().id, PartitionId(1));
        assert_eq!(snapshot.partition_for_key(i64::MAX).unwrap().id, PartitionId(2));
    }

    #[test]
    fn test_gap_rejected() {
        let a = backend("a", StorageKind::Local);
        let result = CatalogSnapshot::new(
            vec![a.clone()],
            vec![
                PartitionDescriptor::new(0, KeyRange::below(10), &a),
                PartitionDescriptor::new(1, KeyRange::at_least(11), &a),
            ],
        );
        assert!(matches!(result, Err(TierError::CatalogInvariant(_))));
    }

    #[test]
    fn test_overlap_rejected() {
        let a = backend("a", StorageKind::Local);
        let result = CatalogSnapshot::new(
            vec![a.clone()],
            vec![
                PartitionDescriptor::new(0, KeyRange::below(10), &a),
                PartitionDescriptor::new(1, KeyRange::at_least(5), &a),
            ],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_transition_is_optimistic() {
        let catalog = Catalog::new(tiers());

        let updated = catalog
            .apply_transition(
                PartitionId(1),
                PartitionState::Active,
                Transition::to(PartitionState::Migrating),
            )
            .unwrap();
        assert_eq!(updated.state, PartitionState::Migrating);
        assert_eq!(updated.version, 1);

        // A second migration on the same partition loses the race
        let conflict = catalog.apply_transition(
            PartitionId(1),
            PartitionState::Active,
            Transition::to(PartitionState::Migrating),
        );
        assert!(matches!(conflict, Err(TierError::CatalogConflict { .. })));

        let moved = catalog
            .apply_transition(
                PartitionId(1),
                PartitionState::Migrating,
                Transition::to(PartitionState::Active).on_backend(BackendId::from("archive-c")),
            )
            .unwrap();
        assert_eq!(moved.backend, BackendId::from("archive-c"));
        assert_eq!(moved.storage_kind, StorageKind::Remote);
        assert_eq!(catalog.version(), 2);
    }

    #[test]
    fn test_old_snapshot_is_unchanged() {
        let catalog = Catalog::new(tiers());
        let before = catalog.snapshot();
        catalog
            .apply_transition(
                PartitionId(1),
                PartitionState::Active,
                Transition::to(PartitionState::Active).on_backend(BackendId::from("archive-c")),
            )
            .unwrap();

        assert_eq!(
            before.partition(PartitionId(1)).unwrap().backend,
            BackendId::from("archive-b")
        );
        assert_eq!(
            catalog.snapshot().partition(PartitionId(1)).unwrap().backend,
            BackendId::from("archive-c")
        );
    }

    #[test]
    fn test_transition_to_unknown_backend() {
        let catalog = Catalog::new(tiers());
        let result = catalog.apply_transition(
            PartitionId(0),
            PartitionState::Active,
            Transition::to(PartitionState::Active).on_backend(BackendId::from("nowhere")),
        );
        assert!(matches!(result, Err(TierError::BackendNotFound(_))));
        assert_eq!(catalog.version(), 0);
    }

    #[test]
    fn test_split_and_merge_preserve_coverage() {
        let catalog = Catalog::new(tiers());

        let new_id = catalog.split_partition(PartitionId(2), 20260101).unwrap();
        assert_eq!(new_id, PartitionId(3));
        let snapshot = catalog.snapshot();
        assert_eq!(snapshot.partitions().len(), 4);
        assert_eq!(
            snapshot.partition(new_id).unwrap().range,
            KeyRange::at_least(20260101)
        );
        assert!(snapshot.validate().is_ok());

        assert!(catalog.split_partition(PartitionId(2), 20250101).is_err());
        assert!(matches!(
            catalog.merge_partitions(PartitionId(1), PartitionId(2)),
            Err(TierError::InvalidQuery(_))
        ));

        catalog.merge_partitions(PartitionId(2), new_id).unwrap();
        let snapshot = catalog.snapshot();
        assert_eq!(snapshot.partitions().len(), 3);
        assert_eq!(snapshot.retired().len(), 1);
        assert_eq!(snapshot.retired()[0].state, PartitionState::Retired);
        assert_eq!(
            snapshot.partition(PartitionId(2)).unwrap().range,
            KeyRange::at_least(20250101)
        );

        let conflict = catalog.apply_transition(
            new_id,
            PartitionState::Active,
            Transition::to(PartitionState::Migrating),
        );
        assert!(matches!(conflict, Err(TierError::CatalogConflict { .. })));
    }

    #[test]
    fn test_register_backend() {
        let catalog = Catalog::new(tiers());
        catalog
            .register_backend(backend("archive-d", StorageKind::Remote))
            .unwrap();
        assert!(catalog
            .snapshot()
            .backend(&BackendId::from("archive-d"))
            .is_some());
        assert!(matches!(
            catalog.register_backend(backend("archive-d", StorageKind::Remote)),
            Err(TierError::BackendAlreadyRegistered(_))
        ));
    }

    #[test]
    fn test_commits_are_persisted() {
        let store = Arc::new(MemoryCatalogStore::new());
        let catalog = Catalog::create(tiers(), store.clone()).unwrap();
        catalog.split_partition(PartitionId(0), 0).unwrap();

        let reopened = Catalog::open(store).unwrap();
        assert_eq!(reopened.version(), catalog.version());
        assert_eq!(reopened.snapshot().partitions(), catalog.snapshot().partitions());
    }

    #[test]
    fn test_concurrent_transitions_on_different_partitions() {
        let catalog = Arc::new(Catalog::new(tiers()));
        let handles: Vec<_> = (0..3)
            .map(|i| {
                let catalog = Arc::clone(&catalog);
                std::thread::spawn(move || {
                    catalog.apply_transition(
                        PartitionId(i),
                        PartitionState::Active,
                        Transition::to(PartitionState::Migrating),
                    )
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }

        let snapshot = catalog.snapshot();
        assert!(snapshot
            .partitions()
            .iter()
            .all(|p| p.state == PartitionState::Migrating));
        assert_eq!(snapshot.version(), 3);
    }
}
