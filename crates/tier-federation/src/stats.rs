//! Federation statistics tracking

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the query and migration paths of one relation
#[derive(Debug, Default)]
pub struct FederationStats {
    /// Queries submitted
    queries: AtomicU64,
    /// Queries that completed with missing partitions
    partial_results: AtomicU64,
    /// Queries that returned an error
    failed_queries: AtomicU64,
    /// Fragments sent to backends
    fragments_dispatched: AtomicU64,
    /// Fragments never sent because an ordered query stopped early
    fragments_skipped: AtomicU64,
    /// Fragment attempts retried after a backend failure
    retries: AtomicU64,
    /// Rows returned to callers
    rows_returned: AtomicU64,
    /// Rows accepted by the write path
    rows_written: AtomicU64,
    migrations_completed: AtomicU64,
    migrations_failed: AtomicU64,
    migrations_aborted: AtomicU64,
}

/// Point-in-time copy of [`FederationStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub queries: u64,
    pub partial_results: u64,
    pub failed_queries: u64,
    pub fragments_dispatched: u64,
    pub fragments_skipped: u64,
    pub retries: u64,
    pub rows_returned: u64,
    pub rows_written: u64,
    pub migrations_completed: u64,
    pub migrations_failed: u64,
    pub migrations_aborted: u64,
}

impl FederationStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_partial(&self) {
        self.partial_results.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatched(&self, fragments: u64) {
        self.fragments_dispatched
            .fetch_add(fragments, Ordering::Relaxed);
    }

    pub fn record_skipped(&self, fragments: u64) {
        self.fragments_skipped.fetch_add(fragments, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rows_returned(&self, rows: u64) {
        self.rows_returned.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn record_rows_written(&self, rows: u64) {
        self.rows_written.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn record_migration_completed(&self) {
        self.migrations_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_migration_failed(&self) {
        self.migrations_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_migration_aborted(&self) {
        self.migrations_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            queries: self.queries.load(Ordering::Relaxed),
            partial_results: self.partial_results.load(Ordering::Relaxed),
            failed_queries: self.failed_queries.load(Ordering::Relaxed),
            fragments_dispatched: self.fragments_dispatched.load(Ordering::Relaxed),
            fragments_skipped: self.fragments_skipped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            rows_returned: self.rows_returned.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            migrations_completed: self.migrations_completed.load(Ordering::Relaxed),
            migrations_failed: self.migrations_failed.load(Ordering::Relaxed),
            migrations_aborted: self.migrations_aborted.load(Ordering::Relaxed),
        }
    }

    /// Reset all statistics
    pub fn reset(&self) {
        for counter in [
            &self.queries,
            &self.partial_results,
            &self.failed_queries,
            &self.fragments_dispatched,
            &self.fragments_skipped,
            &self.retries,
            &self.rows_returned,
            &self.rows_written,
            &self.migrations_completed,
            &self.migrations_failed,
            &self.migrations_aborted,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Counters for one connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Sessions opened on the backend
    created: AtomicU64,
    /// Idle sessions handed out again
    reused: AtomicU64,
    /// Sessions closed because they failed a probe or a request
    discarded: AtomicU64,
    /// Idle sessions closed by the reaper
    reaped: AtomicU64,
    /// Acquires that timed out
    exhausted: AtomicU64,
}

/// Point-in-time copy of [`PoolStats`] plus the pool's current occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub created: u64,
    pub reused: u64,
    pub discarded: u64,
    pub reaped: u64,
    pub exhausted: u64,
    pub idle: usize,
    pub in_use: usize,
    pub max_size: usize,
}

impl PoolStats {
    pub fn record_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reused(&self) {
        self.reused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reaped(&self, count: u64) {
        self.reaped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_exhausted(&self) {
        self.exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, idle: usize, in_use: usize, max_size: usize) -> PoolSnapshot {
        PoolSnapshot {
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            reaped: self.reaped.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            idle,
            in_use,
            max_size,
        }
    }
}
