//! Federated relation
//!
//! The entry point for callers: one partitioned relation spread over
//! several backends. Queries are routed against a catalog snapshot taken at
//! query start, fanned out and merged; writes are routed by key through the
//! partition write gates; migrations are controlled through the
//! orchestrator.

use crate::catalog::Catalog;
use crate::config::FederationConfig;
use crate::executor::{deadline_after, FanOutExecutor};
use crate::fault::{BackendHealth, FaultTracker, RetryPolicy};
use crate::gate::{SnapshotTracker, WriteGates};
use crate::merge::ResultMerger;
use crate::migration::{MigrationJob, MigrationOrchestrator};
use crate::pool::PoolRegistry;
use crate::result::{Completeness, ExecutionStats, QueryResult};
use crate::router::QueryRouter;
use crate::stats::{FederationStats, PoolSnapshot, StatsSnapshot};
use crate::types::{QueryId, QueryOptions};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tier_core::{
    BackendAdapter, BackendId, BackendSession, Key, PartitionId, QuerySpec, Result, Row, Schema,
    TierError,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Write routing is retried this many times when partitions are split or
/// merged underneath a writer
const MAX_WRITE_REROUTES: usize = 3;

/// A partitioned relation federated over several backends
pub struct FederatedRelation {
    name: String,
    schema: Schema,
    config: FederationConfig,
    catalog: Arc<Catalog>,
    pools: Arc<PoolRegistry>,
    gates: Arc<WriteGates>,
    snapshots: Arc<SnapshotTracker>,
    faults: Arc<FaultTracker>,
    stats: Arc<FederationStats>,
    router: QueryRouter,
    executor: FanOutExecutor,
    migrations: Arc<MigrationOrchestrator>,
}

impl FederatedRelation {
    /// Create a relation over `catalog`. Backends named by the catalog still
    /// need an adapter through [`register_backend`](Self::register_backend).
    pub fn new(
        name: impl Into<String>,
        schema: Schema,
        catalog: Catalog,
        config: FederationConfig,
    ) -> Self {
        let catalog = Arc::new(catalog);
        let pools = Arc::new(PoolRegistry::new(config.pool.clone()));
        let gates = Arc::new(WriteGates::new());
        let snapshots = Arc::new(SnapshotTracker::new());
        let faults = Arc::new(FaultTracker::new(config.retry.failure_threshold));
        let stats = Arc::new(FederationStats::new());

        let executor = FanOutExecutor::new(
            Arc::clone(&pools),
            Arc::clone(&faults),
            Arc::clone(&stats),
            RetryPolicy::new(config.retry.clone()),
            config.executor.clone(),
        );
        let migrations = Arc::new(MigrationOrchestrator::new(
            Arc::clone(&catalog),
            Arc::clone(&pools),
            Arc::clone(&gates),
            Arc::clone(&snapshots),
            Arc::clone(&stats),
            schema.clone(),
            config.migration.clone(),
        )
        .with_retry(RetryPolicy::new(config.retry.clone())));

        Self {
            name: name.into(),
            router: QueryRouter::new(schema.clone()),
            schema,
            config,
            catalog,
            pools,
            gates,
            snapshots,
            faults,
            stats,
            executor,
            migrations,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn config(&self) -> &FederationConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn migrations(&self) -> &Arc<MigrationOrchestrator> {
        &self.migrations
    }

    /// Attach the adapter for a backend and create its pool. Backends the
    /// catalog does not know yet are registered in it; known ones have their
    /// handle refreshed (e.g. to attach credentials).
    pub fn register_backend(&self, adapter: Arc<dyn BackendAdapter>) -> Result<()> {
        let backend = adapter.backend_ref().clone();
        self.pools.register(adapter)?;

        match self.catalog.snapshot().backend(&backend.id) {
            Some(existing) if *existing == backend => {}
            Some(_) => self.catalog.refresh_backend(backend.clone())?,
            None => self.catalog.register_backend(backend.clone())?,
        }
        info!(
            "Relation {}: backend {} ({}) attached at {}",
            self.name, backend.id, backend.kind, backend.address
        );
        Ok(())
    }

    /// Run a query with the configured default policy and timeout
    pub async fn query(&self, spec: &QuerySpec) -> Result<QueryResult> {
        self.query_with(spec, QueryOptions::default()).await
    }

    pub async fn query_with(&self, spec: &QuerySpec, options: QueryOptions) -> Result<QueryResult> {
        let query_id = QueryId::new();
        let started = Instant::now();
        let policy = options
            .policy
            .unwrap_or(self.config.executor.default_policy);
        let deadline = deadline_after(
            options
                .timeout
                .unwrap_or_else(|| self.config.executor.default_timeout()),
        );
        self.stats.record_query();

        // One snapshot for the whole query; the lease keeps decommissioning
        // from removing data this snapshot still routes to. It is taken
        // first, so the snapshot loaded next is never older than the lease.
        let _lease = self.snapshots.lease(self.catalog.version());
        let snapshot = self.catalog.snapshot();

        let outcome = async {
            let routed = self.router.route(spec, &snapshot)?;
            let execution = self.executor.execute(&routed, policy, deadline).await?;
            let output = ResultMerger::new(routed.merge).merge(execution.outputs)?;
            Ok::<_, TierError>((output, execution.unavailable, execution.dispatched, execution.skipped, execution.retries))
        }
        .await;

        let (output, mut unavailable, dispatched, skipped, retries) = match outcome {
            Ok(parts) => parts,
            Err(e) => {
                self.stats.record_failure();
                warn!("Query {} failed: {}", query_id, e);
                return Err(e);
            }
        };

        let completeness = if unavailable.is_empty() {
            Completeness::Complete
        } else {
            unavailable.sort();
            self.stats.record_partial();
            warn!(
                "Query {} returned partial results; unavailable partitions: {:?}",
                query_id, unavailable
            );
            Completeness::Partial { unavailable }
        };

        let result = QueryResult {
            query_id,
            output,
            completeness,
            stats: ExecutionStats {
                catalog_version: snapshot.version(),
                fragments_dispatched: dispatched,
                fragments_skipped: skipped,
                retries,
                elapsed_ms: started.elapsed().as_millis() as u64,
            },
        };
        self.stats.record_rows_returned(result.row_count() as u64);
        debug!(
            "Query {} returned {} rows from {} fragments in {}ms",
            query_id,
            result.row_count(),
            dispatched,
            result.stats.elapsed_ms
        );
        Ok(result)
    }

    /// Insert rows, each into the backend owning its key. Returns the number
    /// of rows written.
    ///
    /// A write to a partition paused for cutover waits up to the configured
    /// write timeout and then fails with `PartitionPaused`.
    pub async fn insert(&self, rows: Vec<Row>) -> Result<u64> {
        for row in &rows {
            self.schema.validate_row(row)?;
        }

        let mut pending = rows;
        let mut written = 0u64;
        for _ in 0..MAX_WRITE_REROUTES {
            if pending.is_empty() {
                break;
            }
            let mut rerouted = Vec::new();
            for (partition, rows) in self.group_by_partition(pending)? {
                let (count, moved) = self.write_partition(partition, rows).await?;
                written += count;
                rerouted.extend(moved);
            }
            pending = rerouted;
        }

        if !pending.is_empty() {
            return Err(TierError::CatalogConflict {
                partition: "write path".to_string(),
                expected: "stable routing".to_string(),
                found: format!("{} rows still rerouting", pending.len()),
            });
        }
        self.stats.record_rows_written(written);
        Ok(written)
    }

    fn group_by_partition(&self, rows: Vec<Row>) -> Result<BTreeMap<PartitionId, Vec<Row>>> {
        let snapshot = self.catalog.snapshot();
        let mut groups: BTreeMap<PartitionId, Vec<Row>> = BTreeMap::new();
        for row in rows {
            let key = self.schema.key_of(&row)?;
            let partition = snapshot
                .partition_for_key(key)
                .ok_or_else(|| uncovered(key))?;
            groups.entry(partition.id).or_default().push(row);
        }
        Ok(groups)
    }

    /// Write rows into one partition under its write gate. Rows that no
    /// longer belong to the partition once the gate is held are returned.
    async fn write_partition(
        &self,
        partition: PartitionId,
        rows: Vec<Row>,
    ) -> Result<(u64, Vec<Row>)> {
        let _permit = self
            .gates
            .enter(partition, self.config.write_timeout())
            .await?;

        // Routing may have flipped while this writer waited on the gate
        let snapshot = self.catalog.snapshot();
        let descriptor = snapshot
            .partition(partition)
            .ok_or_else(|| TierError::PartitionNotFound(partition.to_string()))?;

        let mut owned = Vec::with_capacity(rows.len());
        let mut moved = Vec::new();
        for row in rows {
            if descriptor.range.contains(self.schema.key_of(&row)?) {
                owned.push(row);
            } else {
                moved.push(row);
            }
        }
        if owned.is_empty() {
            return Ok((0, moved));
        }

        let pool = self.pools.get(&descriptor.backend)?;
        let mut session = pool.acquire(self.config.pool.acquire_timeout()).await?;
        let timeout = self.config.executor.attempt_timeout();
        let count = tokio::time::timeout(timeout, session.ingest(descriptor.range, owned))
            .await
            .map_err(|_| {
                TierError::unreachable(
                    descriptor.backend.as_str(),
                    format!("write timed out after {}ms", timeout.as_millis()),
                )
            })??;

        debug!(
            "Wrote {} rows to partition {} on {}",
            count, partition, descriptor.backend
        );
        Ok((count, moved))
    }

    /// Split an active partition at `at`; see [`Catalog::split_partition`]
    pub fn split_partition(&self, partition: PartitionId, at: Key) -> Result<PartitionId> {
        self.catalog.split_partition(partition, at)
    }

    /// Merge `right` into `left`; see [`Catalog::merge_partitions`]
    pub fn merge_partitions(&self, left: PartitionId, right: PartitionId) -> Result<()> {
        self.catalog.merge_partitions(left, right)
    }

    /// Start migrating a partition to `target` in the background
    pub async fn start_migration(
        &self,
        partition: PartitionId,
        target: BackendId,
    ) -> Result<MigrationJob> {
        self.migrations.start_migration(partition, target).await
    }

    /// Create a migration job without driving it
    pub async fn begin_migration(
        &self,
        partition: PartitionId,
        target: BackendId,
    ) -> Result<MigrationJob> {
        self.migrations.begin(partition, target).await
    }

    /// Advance a migration by one step
    pub async fn step_migration(&self, partition: PartitionId) -> Result<MigrationJob> {
        self.migrations.advance(partition).await
    }

    /// Migrate a partition to `target` and wait for the outcome
    pub async fn migrate(&self, partition: PartitionId, target: BackendId) -> Result<MigrationJob> {
        self.migrations.begin(partition, target).await?;
        self.migrations.run(partition).await
    }

    pub async fn abort_migration(&self, partition: PartitionId) -> Result<MigrationJob> {
        self.migrations.abort_migration(partition).await
    }

    pub fn migration_status(&self, partition: PartitionId) -> Result<MigrationJob> {
        self.migrations.status(partition)
    }

    pub fn migration_history(&self) -> Vec<MigrationJob> {
        self.migrations.history()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Health of every backend with a pool
    pub fn backend_health(&self) -> Vec<BackendHealth> {
        self.pools
            .pools()
            .iter()
            .map(|pool| self.faults.health(pool.backend()))
            .collect()
    }

    /// Occupancy and counters of every pool, ordered by backend
    pub fn pool_stats(&self) -> Vec<(BackendId, PoolSnapshot)> {
        self.pools
            .pools()
            .iter()
            .map(|pool| (pool.backend().clone(), pool.stats()))
            .collect()
    }

    /// Periodically close idle sessions above each pool's low-water mark
    pub fn spawn_pool_reaper(&self, interval: Duration) -> JoinHandle<()> {
        let pools = Arc::downgrade(&self.pools);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pools) = pools.upgrade() else { break };
                let reaped = pools.reap_all();
                if reaped > 0 {
                    debug!("Reaped {} idle sessions", reaped);
                }
            }
        })
    }
}

fn uncovered(key: Key) -> TierError {
    TierError::CatalogInvariant(format!("no partition covers key {}", key))
}

impl std::fmt::Debug for FederatedRelation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FederatedRelation")
            .field("name", &self.name)
            .field("catalog_version", &self.catalog.version())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogSnapshot, PartitionDescriptor};
    use tier_core::{
        BackendCapabilities, Condition, DataType, Field, KeyRange, StorageKind, Value,
    };
    use tier_storage::MemoryBackend;

    fn schema() -> Schema {
        Schema::new(
            vec![
                Field::new("day", DataType::Int64, false),
                Field::new("amount", DataType::Int64, true),
            ],
            "day",
        )
        .unwrap()
    }

    fn row(day: i64) -> Row {
        vec![Value::Int64(day), Value::Int64(1)]
    }

    fn relation() -> (FederatedRelation, MemoryBackend, MemoryBackend) {
        let caps = BackendCapabilities::full();
        let cold = MemoryBackend::named("cold", StorageKind::Remote, caps, schema());
        let hot = MemoryBackend::named("hot", StorageKind::Local, caps, schema());
        let snapshot = CatalogSnapshot::new(
            vec![cold.backend_ref().clone(), hot.backend_ref().clone()],
            vec![
                PartitionDescriptor::new(0, KeyRange::below(100), cold.backend_ref()),
                PartitionDescriptor::new(1, KeyRange::at_least(100), hot.backend_ref()),
            ],
        )
        .unwrap();
        let relation = FederatedRelation::new(
            "events",
            schema(),
            Catalog::new(snapshot),
            FederationConfig::default(),
        );
        relation.register_backend(Arc::new(cold.clone())).unwrap();
        relation.register_backend(Arc::new(hot.clone())).unwrap();
        (relation, cold, hot)
    }

    #[tokio::test]
    async fn test_insert_routes_by_key() {
        let (relation, cold, hot) = relation();
        let written = relation
            .insert(vec![row(5), row(150), row(99), row(100)])
            .await
            .unwrap();

        assert_eq!(written, 4);
        assert_eq!(cold.row_count(), 2);
        assert_eq!(hot.row_count(), 2);
        assert_eq!(relation.stats().rows_written, 4);
    }

    #[tokio::test]
    async fn test_register_known_backend_keeps_catalog_version() {
        let (relation, _, _) = relation();
        assert_eq!(relation.catalog().version(), 0);

        let extra = MemoryBackend::named(
            "archive",
            StorageKind::Remote,
            BackendCapabilities::default(),
            schema(),
        );
        relation.register_backend(Arc::new(extra.clone())).unwrap();
        assert_eq!(relation.catalog().version(), 1);
        assert!(matches!(
            relation.register_backend(Arc::new(extra)),
            Err(TierError::BackendAlreadyRegistered(_))
        ));
    }

    #[tokio::test]
    async fn test_write_waits_for_paused_partition() {
        let (relation, _, _) = relation();
        let pause = relation
            .gates
            .pause(PartitionId(0), Duration::from_millis(10))
            .await
            .unwrap();

        let result = relation.insert(vec![row(5)]).await;
        assert!(matches!(result, Err(TierError::PartitionPaused { .. })));

        drop(pause);
        assert_eq!(relation.insert(vec![row(5)]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_query_records_stats() {
        let (relation, _, _) = relation();
        relation.insert(vec![row(5), row(150)]).await.unwrap();

        let result = relation
            .query(&QuerySpec::scan().filter(Condition::eq("day", 150)))
            .await
            .unwrap();
        assert_eq!(result.rows(), &[row(150)]);
        assert!(result.is_complete());
        assert_eq!(result.stats.fragments_dispatched, 1);

        let stats = relation.stats();
        assert_eq!(stats.queries, 1);
        assert_eq!(stats.rows_returned, 1);
    }

    #[tokio::test]
    async fn test_in_flight_query_keeps_source_until_done() {
        let (relation, cold, _) = relation();
        let archive = MemoryBackend::named(
            "archive",
            StorageKind::Remote,
            BackendCapabilities::full(),
            schema(),
        );
        relation.register_backend(Arc::new(archive.clone())).unwrap();
        relation.insert((0..10).map(row).collect()).await.unwrap();
        let relation = Arc::new(relation);

        // The query routes to `cold` and is still reading when routing moves
        cold.set_latency(Duration::from_millis(300));
        let reader = Arc::clone(&relation);
        let query = tokio::spawn(async move {
            reader
                .query(&QuerySpec::scan().filter(Condition::between("day", 0, 99)))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cold.set_latency(Duration::ZERO);

        let job = relation
            .migrate(PartitionId(0), BackendId::from("archive"))
            .await
            .unwrap();
        assert_eq!(job.phase, crate::migration::MigrationPhase::Done);

        let result = query.await.unwrap().unwrap();
        assert!(result.is_complete());
        assert_eq!(result.row_count(), 10);
        assert_eq!(cold.row_count(), 0);
        assert_eq!(archive.row_count(), 10);
    }

    #[tokio::test]
    async fn test_invalid_query_counts_as_failure() {
        let (relation, _, _) = relation();
        let result = relation
            .query(&QuerySpec::scan().filter(Condition::eq("missing", 1)))
            .await;
        assert!(result.is_err());
        assert_eq!(relation.stats().failed_queries, 1);
    }
}
