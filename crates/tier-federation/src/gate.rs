//! Coordination between live traffic and migrations
//!
//! Writers hold a partition's gate shared while they route and ingest.
//! Cutover takes it exclusively, which drains in-flight writes and holds new
//! ones back until routing has flipped. Only the one partition is paused.
//!
//! Queries hold a [`SnapshotLease`] on the catalog version they routed
//! against, so decommissioning can wait until no query still reads from a
//! source backend through a pre-cutover snapshot.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tier_core::{PartitionId, Result, TierError};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Held by a writer while it writes into one partition
pub type WritePermit = OwnedRwLockReadGuard<()>;

/// Held by cutover while the partition is paused
pub type WritePause = OwnedRwLockWriteGuard<()>;

#[derive(Debug, Default)]
pub struct WriteGates {
    gates: DashMap<PartitionId, Arc<RwLock<()>>>,
}

impl WriteGates {
    pub fn new() -> Self {
        Self::default()
    }

    fn gate(&self, partition: PartitionId) -> Arc<RwLock<()>> {
        Arc::clone(
            self.gates
                .entry(partition)
                .or_insert_with(|| Arc::new(RwLock::new(())))
                .value(),
        )
    }

    /// Enter the partition for writing. Waits at most `timeout` if the
    /// partition is paused, then fails with `PartitionPaused`.
    pub async fn enter(&self, partition: PartitionId, timeout: Duration) -> Result<WritePermit> {
        let started = Instant::now();
        tokio::time::timeout(timeout, self.gate(partition).read_owned())
            .await
            .map_err(|_| TierError::PartitionPaused {
                partition: partition.to_string(),
                waited_ms: started.elapsed().as_millis() as u64,
            })
    }

    /// Pause writes to the partition once in-flight writers have left.
    /// Returns `None` if they did not drain within `timeout`.
    pub async fn pause(&self, partition: PartitionId, timeout: Duration) -> Option<WritePause> {
        tokio::time::timeout(timeout, self.gate(partition).write_owned())
            .await
            .ok()
    }

    /// Whether the partition is currently paused
    pub fn is_paused(&self, partition: PartitionId) -> bool {
        self.gates
            .get(&partition)
            .map_or(false, |gate| gate.try_read().is_err())
    }
}

/// Counts in-flight queries per catalog version
#[derive(Debug, Default)]
pub struct SnapshotTracker {
    active: Mutex<BTreeMap<u64, usize>>,
}

impl SnapshotTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a query routed against catalog `version`
    pub fn lease(self: &Arc<Self>, version: u64) -> SnapshotLease {
        *self.active.lock().entry(version).or_insert(0) += 1;
        SnapshotLease {
            tracker: Arc::clone(self),
            version,
        }
    }

    /// Oldest catalog version still used by a query
    pub fn oldest(&self) -> Option<u64> {
        self.active.lock().keys().next().copied()
    }

    /// Whether any query still uses a version older than `version`
    pub fn pins_before(&self, version: u64) -> bool {
        self.oldest().map_or(false, |oldest| oldest < version)
    }

    fn release(&self, version: u64) {
        let mut active = self.active.lock();
        if let Some(count) = active.get_mut(&version) {
            *count -= 1;
            if *count == 0 {
                active.remove(&version);
            }
        }
    }
}

/// Released when the query finishes
#[derive(Debug)]
pub struct SnapshotLease {
    tracker: Arc<SnapshotTracker>,
    version: u64,
}

impl SnapshotLease {
    pub fn version(&self) -> u64 {
        self.version
    }
}

impl Drop for SnapshotLease {
    fn drop(&mut self) {
        self.tracker.release(self.version);
    }
}
