//! Migration orchestrator
//!
//! Moves one partition between backends through the phases
//! `preparing → copying → verifying → cutover → decommissioning → done`,
//! with `failed` reachable from every phase before the routing flip.
//! The catalog only changes at the start (active → migrating), at cutover
//! (one atomic transition to the target) and on rollback.
//!
//! Jobs are driven one step at a time with [`MigrationOrchestrator::advance`]
//! or to completion with [`MigrationOrchestrator::run`]. Copying reads the
//! source through the same pools as live queries.

use crate::catalog::{Catalog, PartitionState, Transition};
use crate::config::{MigrationConfig, RetryConfig};
use crate::fault::RetryPolicy;
use crate::gate::{SnapshotTracker, WriteGates};
use crate::pool::{PoolRegistry, PooledSession};
use crate::stats::FederationStats;
use crate::types::{now_millis, MigrationId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tier_core::{
    BackendId, BackendRef, BackendSession, Fragment, FragmentResult, KeyRange, PartitionId,
    RangeChecksum, Result, Row, Schema, SortDirection, TierError,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Verification mismatches caused by writes during copying trigger a full
/// recopy at most this many times
const MAX_RESYNCS: u32 = 3;

/// Poll interval while a step waits on live traffic
const WAIT_POLL: Duration = Duration::from_millis(10);

/// Phase of a migration job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationPhase {
    Preparing,
    Copying,
    Verifying,
    Cutover,
    Decommissioning,
    Done,
    Failed,
}

impl MigrationPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationPhase::Done | MigrationPhase::Failed)
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MigrationPhase::Preparing => "preparing",
            MigrationPhase::Copying => "copying",
            MigrationPhase::Verifying => "verifying",
            MigrationPhase::Cutover => "cutover",
            MigrationPhase::Decommissioning => "decommissioning",
            MigrationPhase::Done => "done",
            MigrationPhase::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// A partition move, retained after completion as an audit record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationJob {
    pub id: MigrationId,
    pub partition_id: PartitionId,
    pub range: KeyRange,
    pub source_backend: BackendId,
    pub target_backend: BackendId,
    pub phase: MigrationPhase,
    /// Rows written to the target by the current copy pass
    pub rows_copied: u64,
    pub row_count_source: Option<u64>,
    pub row_count_target: Option<u64>,
    /// Milliseconds since the Unix epoch
    pub started_at: u64,
    pub completed_at: Option<u64>,
    /// Failure cause for failed or aborted jobs
    pub failure: Option<String>,
}

impl fmt::Display for MigrationJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} -> {} [{}] copied={}",
            self.id,
            self.partition_id,
            self.range,
            self.source_backend,
            self.target_backend,
            self.phase,
            self.rows_copied
        )
    }
}

/// Result of one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Progressed,
    /// Blocked on live traffic or the grace period; try again after the delay
    Wait(Duration),
}

struct JobState {
    job: MigrationJob,
    /// Part of the range the current copy pass has not reached yet
    remaining: Option<KeyRange>,
    /// Source checksum when the current copy pass began
    baseline: RangeChecksum,
    /// Source checksum the target matched at verification
    verified: Option<RangeChecksum>,
    resyncs: u32,
    /// Catalog version that moved routing to the target
    flipped_at: Option<u64>,
    decommission_after: Option<Instant>,
    /// Consecutive failed attempts to purge the source
    cleanup_failures: u32,
}

struct JobHandle {
    state: Mutex<JobState>,
}

/// Drives partition migrations for one relation
pub struct MigrationOrchestrator {
    catalog: Arc<Catalog>,
    pools: Arc<PoolRegistry>,
    gates: Arc<WriteGates>,
    snapshots: Arc<SnapshotTracker>,
    stats: Arc<FederationStats>,
    schema: Schema,
    config: MigrationConfig,
    /// Backoff for retrying source cleanup after routing moved
    retry: RetryPolicy,
    active: DashMap<PartitionId, Arc<JobHandle>>,
    /// Most recent job per partition, active or finished
    latest: DashMap<PartitionId, MigrationJob>,
    /// Finished jobs in completion order
    history: RwLock<Vec<MigrationJob>>,
}

impl MigrationOrchestrator {
    pub fn new(
        catalog: Arc<Catalog>,
        pools: Arc<PoolRegistry>,
        gates: Arc<WriteGates>,
        snapshots: Arc<SnapshotTracker>,
        stats: Arc<FederationStats>,
        schema: Schema,
        config: MigrationConfig,
    ) -> Self {
        Self {
            catalog,
            pools,
            gates,
            snapshots,
            stats,
            schema,
            config,
            retry: RetryPolicy::new(RetryConfig::default()),
            active: DashMap::new(),
            latest: DashMap::new(),
            history: RwLock::new(Vec::new()),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Create a job and mark the partition migrating.
    ///
    /// Fails with `CatalogConflict` if the partition is not active, which is
    /// what keeps two migrations off the same partition.
    pub async fn begin(&self, partition: PartitionId, target: BackendId) -> Result<MigrationJob> {
        let snapshot = self.catalog.snapshot();
        let descriptor = snapshot
            .partition(partition)
            .ok_or_else(|| TierError::PartitionNotFound(partition.to_string()))?;
        if descriptor.backend == target {
            return Err(TierError::MigrationRejected(format!(
                "partition {} already lives on {}",
                partition, target
            )));
        }
        if snapshot.backend(&target).is_none() {
            return Err(TierError::BackendNotFound(target.to_string()));
        }
        self.pools.get(&target)?;

        // The slot stays locked until the job is in place, so a second begin
        // sees either the partition state or the running job
        let slot = match self.active.entry(partition) {
            Entry::Occupied(running) => {
                let found = self
                    .latest
                    .get(running.key())
                    .map(|job| format!("migration {} in {}", job.id, job.phase))
                    .unwrap_or_else(|| "running migration".to_string());
                return Err(TierError::CatalogConflict {
                    partition: partition.to_string(),
                    expected: "no running migration".to_string(),
                    found,
                });
            }
            Entry::Vacant(slot) => slot,
        };

        let descriptor = self.catalog.apply_transition(
            partition,
            PartitionState::Active,
            Transition::to(PartitionState::Migrating),
        )?;

        let job = MigrationJob {
            id: MigrationId::new(),
            partition_id: partition,
            range: descriptor.range,
            source_backend: descriptor.backend.clone(),
            target_backend: target,
            phase: MigrationPhase::Preparing,
            rows_copied: 0,
            row_count_source: None,
            row_count_target: None,
            started_at: now_millis(),
            completed_at: None,
            failure: None,
        };
        info!(
            "Migration {} of partition {} {} started: {} -> {}",
            job.id, partition, job.range, job.source_backend, job.target_backend
        );

        self.latest.insert(partition, job.clone());
        slot.insert(Arc::new(JobHandle {
            state: Mutex::new(JobState {
                remaining: Some(job.range),
                job: job.clone(),
                baseline: RangeChecksum::default(),
                verified: None,
                resyncs: 0,
                flipped_at: None,
                decommission_after: None,
                cleanup_failures: 0,
            }),
        }));
        Ok(job)
    }

    /// Perform one step of the partition's active migration
    pub async fn advance(&self, partition: PartitionId) -> Result<MigrationJob> {
        let handle = self.handle(partition)?;
        let mut state = handle.state.lock().await;
        self.step(&mut state).await?;
        Ok(state.job.clone())
    }

    /// Drive the partition's active migration to `done` or `failed`
    pub async fn run(&self, partition: PartitionId) -> Result<MigrationJob> {
        let handle = self.handle(partition)?;
        loop {
            let step = {
                let mut state = handle.state.lock().await;
                if state.job.phase.is_terminal() {
                    return Ok(state.job.clone());
                }
                let step = self.step(&mut state).await?;
                if state.job.phase.is_terminal() {
                    return Ok(state.job.clone());
                }
                step
            };

            let delay = match step {
                Step::Progressed => self.config.step_delay(),
                Step::Wait(wait) => wait.max(self.config.step_delay()),
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Begin a migration and run its preparing step, then drive the rest on
    /// a background task. Target problems surface here as
    /// `TargetUnreachable`; later outcomes are visible through
    /// [`status`](Self::status).
    pub async fn start_migration(
        self: &Arc<Self>,
        partition: PartitionId,
        target: BackendId,
    ) -> Result<MigrationJob> {
        self.begin(partition, target).await?;
        let job = self.advance(partition).await?;

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            match orchestrator.run(partition).await {
                Ok(job) => debug!("Background migration finished: {}", job),
                Err(e) => error!("Migration of partition {} failed: {}", partition, e),
            }
        });
        Ok(job)
    }

    /// Abort the partition's migration and restore its pre-migration state.
    /// Rejected once routing has moved to the target.
    pub async fn abort_migration(&self, partition: PartitionId) -> Result<MigrationJob> {
        let handle = self.handle(partition)?;
        let mut state = handle.state.lock().await;
        match state.job.phase {
            MigrationPhase::Decommissioning | MigrationPhase::Done | MigrationPhase::Failed => {
                Err(TierError::MigrationRejected(format!(
                    "migration {} of partition {} is {}; routing already moved or job finished",
                    state.job.id, partition, state.job.phase
                )))
            }
            _ => {
                warn!("Aborting migration {} of partition {}", state.job.id, partition);
                self.roll_back(&mut state, "aborted by operator".to_string())
                    .await;
                self.stats.record_migration_aborted();
                Ok(state.job.clone())
            }
        }
    }

    /// Latest job for the partition, active or finished
    pub fn status(&self, partition: PartitionId) -> Result<MigrationJob> {
        self.latest
            .get(&partition)
            .map(|job| job.clone())
            .ok_or_else(|| TierError::MigrationNotFound(partition.to_string()))
    }

    /// Finished jobs, oldest first
    pub fn history(&self) -> Vec<MigrationJob> {
        self.history.read().clone()
    }

    /// Jobs still in progress
    pub fn active(&self) -> Vec<MigrationJob> {
        let partitions: Vec<PartitionId> = self.active.iter().map(|e| *e.key()).collect();
        let mut jobs: Vec<MigrationJob> = partitions
            .into_iter()
            .filter_map(|p| self.latest.get(&p).map(|job| job.clone()))
            .collect();
        jobs.sort_by_key(|job| job.partition_id);
        jobs
    }

    fn handle(&self, partition: PartitionId) -> Result<Arc<JobHandle>> {
        self.active
            .get(&partition)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| TierError::MigrationNotFound(partition.to_string()))
    }

    async fn step(&self, state: &mut JobState) -> Result<Step> {
        let phase = state.job.phase;
        let outcome = match phase {
            MigrationPhase::Preparing => self.prepare(state).await,
            MigrationPhase::Copying => self.copy_chunk(state).await,
            MigrationPhase::Verifying => self.verify(state).await,
            MigrationPhase::Cutover => self.cutover(state).await,
            MigrationPhase::Decommissioning => {
                // Routing already moved; the job stays here until the source
                // can be cleaned up
                return match self.decommission(state).await {
                    Err(e) if e.is_retryable() => {
                        state.cleanup_failures += 1;
                        let delay = self.retry.backoff(state.cleanup_failures + 1);
                        warn!(
                            "Cleanup of partition {} on {} failed (attempt {}), retry in {}ms: {}",
                            state.job.partition_id,
                            state.job.source_backend,
                            state.cleanup_failures,
                            delay.as_millis(),
                            e
                        );
                        Ok(Step::Wait(delay.max(WAIT_POLL)))
                    }
                    Err(e) => {
                        warn!(
                            "Decommissioning partition {} on {} failed: {}",
                            state.job.partition_id, state.job.source_backend, e
                        );
                        Err(e)
                    }
                    ok => ok,
                };
            }
            MigrationPhase::Done | MigrationPhase::Failed => return Ok(Step::Progressed),
        };

        match outcome {
            Ok(step) => {
                if state.job.phase != phase {
                    info!(
                        "Migration {} of partition {}: {} -> {}",
                        state.job.id, state.job.partition_id, phase, state.job.phase
                    );
                }
                self.publish(state);
                Ok(step)
            }
            Err(e) => {
                error!(
                    "Migration {} of partition {} failed during {}: {}",
                    state.job.id, state.job.partition_id, phase, e
                );
                self.roll_back(state, e.to_string()).await;
                self.stats.record_migration_failed();
                Err(e)
            }
        }
    }

    async fn prepare(&self, state: &mut JobState) -> Result<Step> {
        let job = &state.job;
        let mut target = self.target_session(&job.target_backend).await?;
        self.within(job.target_backend.as_str(), target.health_check())
            .await
            .map_err(target_error)?;

        // Leftovers of an earlier failed attempt
        let stale = self
            .within(job.target_backend.as_str(), target.purge(job.range))
            .await
            .map_err(target_error)?;
        if stale > 0 {
            warn!(
                "Removed {} stale rows for {} from {}",
                stale, job.range, job.target_backend
            );
        }
        drop(target);

        let baseline = self.source_checksum(job).await?;
        state.baseline = baseline;
        state.job.row_count_source = Some(baseline.row_count);
        state.remaining = Some(state.job.range);
        state.job.phase = MigrationPhase::Copying;
        Ok(Step::Progressed)
    }

    async fn copy_chunk(&self, state: &mut JobState) -> Result<Step> {
        if let Some(remaining) = state.remaining {
            let (written, rest) = self.copy_next(&state.job, remaining).await?;
            state.job.rows_copied += written;
            state.remaining = rest;
            debug!(
                "Copied {} rows of {} to {} ({} so far)",
                written, state.job.partition_id, state.job.target_backend, state.job.rows_copied
            );
        }
        if state.remaining.is_none() {
            state.job.phase = MigrationPhase::Verifying;
        }
        Ok(Step::Progressed)
    }

    /// Copy the next chunk of `remaining` to the target. Returns the rows
    /// written and what is left. A chunk never splits the rows of one key.
    async fn copy_next(
        &self,
        job: &MigrationJob,
        remaining: KeyRange,
    ) -> Result<(u64, Option<KeyRange>)> {
        let source = self.backend_ref(&job.source_backend)?;
        let batch = self.config.copy_batch_rows.max(1);
        let chunked = source.capabilities.supports_ordered_scan;

        let mut fragment = Fragment::scan(job.partition_id, Arc::clone(&source), remaining);
        if chunked {
            fragment = fragment.ordered(SortDirection::Ascending).with_limit(batch);
        }
        let mut rows = self.fetch(job, &fragment).await?;

        let mut chunk_end = remaining.end;
        if chunked && rows.len() >= batch {
            let last_key = self.schema.key_of(&rows[rows.len() - 1])?;
            let mut cut = rows.len();
            while cut > 0 && self.schema.key_of(&rows[cut - 1])? == last_key {
                cut -= 1;
            }
            rows.truncate(cut);

            if rows.is_empty() {
                // One key fills the whole batch; take all of its rows
                chunk_end = last_key.checked_add(1);
                let whole_key = Fragment::scan(
                    job.partition_id,
                    source,
                    KeyRange::new(remaining.start, chunk_end),
                );
                rows = self.fetch(job, &whole_key).await?;
            } else {
                chunk_end = Some(last_key);
            }
        }

        let chunk = KeyRange::new(remaining.start, chunk_end);
        let written = if rows.is_empty() {
            0
        } else {
            let mut target = self.target_session(&job.target_backend).await?;
            self.within(job.target_backend.as_str(), target.ingest(chunk, rows))
                .await
                .map_err(target_error)?
        };

        let rest = match (chunk_end, remaining.end) {
            (Some(end), Some(limit)) if end < limit => Some(KeyRange::new(Some(end), Some(limit))),
            (Some(end), None) => Some(KeyRange::at_least(end)),
            _ => None,
        };
        Ok((written, rest))
    }

    async fn verify(&self, state: &mut JobState) -> Result<Step> {
        let source = self.source_checksum(&state.job).await?;
        let target = self.target_checksum(&state.job).await?;
        state.job.row_count_source = Some(source.row_count);
        state.job.row_count_target = Some(target.row_count);

        if source == target {
            state.verified = Some(source);
            state.job.phase = MigrationPhase::Cutover;
            return Ok(Step::Progressed);
        }

        if source != state.baseline && state.resyncs < MAX_RESYNCS {
            // Writes landed on the source while copying; start a fresh pass
            info!(
                "Source of partition {} changed during copy ({} -> {}); recopying",
                state.job.partition_id, state.baseline, source
            );
            self.purge_target(&state.job).await?;
            state.resyncs += 1;
            state.baseline = source;
            state.remaining = Some(state.job.range);
            state.job.rows_copied = 0;
            state.job.phase = MigrationPhase::Copying;
            return Ok(Step::Progressed);
        }

        Err(TierError::VerificationFailed {
            partition: state.job.partition_id.to_string(),
            detail: format!("source {} != target {}", source, target),
        })
    }

    async fn cutover(&self, state: &mut JobState) -> Result<Step> {
        let partition = state.job.partition_id;
        let Some(pause) = self
            .gates
            .pause(partition, self.config.cutover_pause_timeout())
            .await
        else {
            debug!(
                "Writes to partition {} did not drain within {}ms; cutover will retry",
                partition, self.config.cutover_pause_timeout_ms
            );
            return Ok(Step::Wait(WAIT_POLL));
        };

        let source = self.source_checksum(&state.job).await?;
        if state.verified != Some(source) {
            // Writes landed after verification; resync under the pause
            info!(
                "Final sync of partition {} inside the write pause",
                partition
            );
            self.purge_target(&state.job).await?;
            let mut remaining = Some(state.job.range);
            let mut copied = 0;
            while let Some(range) = remaining {
                let (written, rest) = self.copy_next(&state.job, range).await?;
                copied += written;
                remaining = rest;
            }
            state.job.rows_copied = copied;

            let target = self.target_checksum(&state.job).await?;
            state.job.row_count_source = Some(source.row_count);
            state.job.row_count_target = Some(target.row_count);
            if source != target {
                return Err(TierError::VerificationFailed {
                    partition: partition.to_string(),
                    detail: format!("after final sync source {} != target {}", source, target),
                });
            }
            state.verified = Some(source);
        }

        let flipped = self.catalog.apply_transition(
            partition,
            PartitionState::Migrating,
            Transition::to(PartitionState::Active).on_backend(state.job.target_backend.clone()),
        )?;
        drop(pause);

        info!(
            "Cutover of partition {}: routing moved {} -> {} at catalog v{}",
            partition, state.job.source_backend, state.job.target_backend, flipped.version
        );
        state.flipped_at = Some(flipped.version);
        state.decommission_after = Some(Instant::now() + self.config.decommission_grace());
        state.job.phase = MigrationPhase::Decommissioning;
        Ok(Step::Progressed)
    }

    async fn decommission(&self, state: &mut JobState) -> Result<Step> {
        if let Some(after) = state.decommission_after {
            let now = Instant::now();
            if now < after {
                return Ok(Step::Wait(after - now));
            }
        }
        if let Some(version) = state.flipped_at {
            if self.snapshots.pins_before(version) {
                debug!(
                    "Partition {} still read through a pre-cutover snapshot; waiting",
                    state.job.partition_id
                );
                return Ok(Step::Wait(WAIT_POLL));
            }
        }

        let job = &state.job;
        let mut source = self.session(&job.source_backend).await?;
        let removed = self
            .within(job.source_backend.as_str(), source.purge(job.range))
            .await?;
        drop(source);

        state.job.phase = MigrationPhase::Done;
        state.job.completed_at = Some(now_millis());
        info!(
            "Migration {} of partition {} done: {} rows on {}, {} removed from {}",
            state.job.id,
            state.job.partition_id,
            state.job.row_count_target.unwrap_or(state.job.rows_copied),
            state.job.target_backend,
            removed,
            state.job.source_backend
        );
        self.stats.record_migration_completed();
        self.finish(state);
        Ok(Step::Progressed)
    }

    /// Discard target data, route the partition back to the source and
    /// retire the job as failed
    async fn roll_back(&self, state: &mut JobState, cause: String) {
        let partition = state.job.partition_id;
        if let Err(e) = self.purge_target(&state.job).await {
            error!(
                "Could not discard copied rows of partition {} on {}: {}",
                partition, state.job.target_backend, e
            );
        }
        match self.catalog.apply_transition(
            partition,
            PartitionState::Migrating,
            Transition::to(PartitionState::Active),
        ) {
            Ok(_) => warn!(
                "Partition {} reverted to active on {}",
                partition, state.job.source_backend
            ),
            Err(e) => error!("Could not revert partition {}: {}", partition, e),
        }

        state.remaining = None;
        state.job.phase = MigrationPhase::Failed;
        state.job.failure = Some(cause);
        state.job.completed_at = Some(now_millis());
        self.finish(state);
    }

    fn publish(&self, state: &JobState) {
        self.latest.insert(state.job.partition_id, state.job.clone());
    }

    fn finish(&self, state: &JobState) {
        self.publish(state);
        self.history.write().push(state.job.clone());
        self.active.remove(&state.job.partition_id);
    }

    fn backend_ref(&self, backend: &BackendId) -> Result<Arc<BackendRef>> {
        self.catalog
            .snapshot()
            .backend(backend)
            .ok_or_else(|| TierError::BackendNotFound(backend.to_string()))
    }

    async fn session(&self, backend: &BackendId) -> Result<PooledSession> {
        let pool = self.pools.get(backend)?;
        pool.acquire(self.pools.config().acquire_timeout()).await
    }

    async fn target_session(&self, backend: &BackendId) -> Result<PooledSession> {
        self.session(backend).await.map_err(target_error)
    }

    /// Bound a backend operation by the configured operation timeout
    async fn within<T>(&self, backend: &str, operation: impl Future<Output = Result<T>>) -> Result<T> {
        let timeout = self.config.operation_timeout();
        tokio::time::timeout(timeout, operation)
            .await
            .map_err(|_| {
                TierError::unreachable(
                    backend,
                    format!("operation timed out after {}ms", timeout.as_millis()),
                )
            })?
    }

    async fn fetch(&self, job: &MigrationJob, fragment: &Fragment) -> Result<Vec<Row>> {
        let mut source = self.session(&job.source_backend).await?;
        let deadline = tokio::time::Instant::now() + self.config.operation_timeout();
        let result = self
            .within(job.source_backend.as_str(), source.execute(fragment, deadline))
            .await?;
        match result {
            FragmentResult::Rows(rows) => Ok(rows),
            FragmentResult::Partial(_) => Err(TierError::Storage(format!(
                "{} answered a copy scan with an aggregate",
                job.source_backend
            ))),
        }
    }

    async fn source_checksum(&self, job: &MigrationJob) -> Result<RangeChecksum> {
        let mut source = self.session(&job.source_backend).await?;
        self.within(job.source_backend.as_str(), source.checksum(job.range))
            .await
    }

    async fn target_checksum(&self, job: &MigrationJob) -> Result<RangeChecksum> {
        let mut target = self.target_session(&job.target_backend).await?;
        self.within(job.target_backend.as_str(), target.checksum(job.range))
            .await
            .map_err(target_error)
    }

    async fn purge_target(&self, job: &MigrationJob) -> Result<u64> {
        let mut target = self.target_session(&job.target_backend).await?;
        self.within(job.target_backend.as_str(), target.purge(job.range))
            .await
            .map_err(target_error)
    }
}

/// Connectivity problems on the target are reported as `TargetUnreachable`
fn target_error(error: TierError) -> TierError {
    match error {
        TierError::BackendUnreachable { backend, reason } => {
            TierError::TargetUnreachable { backend, reason }
        }
        TierError::PoolExhausted { backend, waited_ms } => TierError::TargetUnreachable {
            backend,
            reason: format!("no free session after {}ms", waited_ms),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogSnapshot, PartitionDescriptor};
    use crate::config::PoolConfig;
    use tier_core::{
        BackendAdapter, BackendCapabilities, DataType, Field, StorageKind, Value,
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

    fn row(day: i64, amount: i64) -> Row {
        vec![Value::Int64(day), Value::Int64(amount)]
    }

    struct Fixture {
        source: MemoryBackend,
        target: MemoryBackend,
        catalog: Arc<Catalog>,
        gates: Arc<WriteGates>,
        snapshots: Arc<SnapshotTracker>,
        stats: Arc<FederationStats>,
        orchestrator: Arc<MigrationOrchestrator>,
    }

    /// `p0 = [-inf, 100)` on archive-b, `p1 = [100, +inf)` on primary; an
    /// empty archive-c is the migration target
    fn fixture(config: MigrationConfig) -> Fixture {
        let caps = BackendCapabilities::full();
        let source = MemoryBackend::named("archive-b", StorageKind::Remote, caps, schema());
        let target = MemoryBackend::named("archive-c", StorageKind::Remote, caps, schema());
        let primary = MemoryBackend::named("primary", StorageKind::Local, caps, schema());
        source
            .load((1..=9).map(|d| row(d * 10, d)).collect())
            .unwrap();

        let snapshot = CatalogSnapshot::new(
            vec![
                source.backend_ref().clone(),
                target.backend_ref().clone(),
                primary.backend_ref().clone(),
            ],
            vec![
                PartitionDescriptor::new(0, KeyRange::below(100), source.backend_ref()),
                PartitionDescriptor::new(1, KeyRange::at_least(100), primary.backend_ref()),
            ],
        )
        .unwrap();
        let catalog = Arc::new(Catalog::new(snapshot));

        let pools = Arc::new(PoolRegistry::new(PoolConfig::default()));
        for backend in [&source, &target, &primary] {
            pools.register(Arc::new(backend.clone())).unwrap();
        }

        let gates = Arc::new(WriteGates::new());
        let snapshots = Arc::new(SnapshotTracker::new());
        let stats = Arc::new(FederationStats::new());
        let orchestrator = Arc::new(MigrationOrchestrator::new(
            Arc::clone(&catalog),
            pools,
            Arc::clone(&gates),
            Arc::clone(&snapshots),
            Arc::clone(&stats),
            schema(),
            config,
        ));
        Fixture {
            source,
            target,
            catalog,
            gates,
            snapshots,
            stats,
            orchestrator,
        }
    }

    fn small_batches() -> MigrationConfig {
        MigrationConfig::default()
            .with_copy_batch_rows(4)
            .with_cutover_pause_timeout(Duration::from_millis(20))
    }

    fn target_id() -> BackendId {
        BackendId::from("archive-c")
    }

    #[tokio::test]
    async fn test_migration_moves_partition() {
        let f = fixture(small_batches());
        let before = f.source.rows().unwrap();

        f.orchestrator.begin(PartitionId(0), target_id()).await.unwrap();
        let job = f.orchestrator.run(PartitionId(0)).await.unwrap();

        assert_eq!(job.phase, MigrationPhase::Done);
        assert_eq!(job.row_count_source, Some(9));
        assert_eq!(job.row_count_target, Some(9));
        assert_eq!(f.target.rows().unwrap(), before);
        assert_eq!(f.source.row_count(), 0);

        let partition = f.catalog.snapshot().partition(PartitionId(0)).cloned().unwrap();
        assert_eq!(partition.backend, target_id());
        assert_eq!(partition.state, PartitionState::Active);
        assert_eq!(f.orchestrator.history(), vec![job]);
        assert_eq!(f.stats.snapshot().migrations_completed, 1);
    }

    #[tokio::test]
    async fn test_step_wise_phases() {
        let f = fixture(small_batches());
        f.orchestrator.begin(PartitionId(0), target_id()).await.unwrap();

        let mut phases = vec![f.orchestrator.status(PartitionId(0)).unwrap().phase];
        loop {
            let job = f.orchestrator.advance(PartitionId(0)).await.unwrap();
            if phases.last() != Some(&job.phase) {
                phases.push(job.phase);
            }
            if job.phase.is_terminal() {
                break;
            }
        }
        assert_eq!(
            phases,
            vec![
                MigrationPhase::Preparing,
                MigrationPhase::Copying,
                MigrationPhase::Verifying,
                MigrationPhase::Cutover,
                MigrationPhase::Decommissioning,
                MigrationPhase::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_chunks_keep_equal_keys_together() {
        let f = fixture(MigrationConfig::default().with_copy_batch_rows(2));
        f.source
            .load(vec![row(55, 100), row(55, 101), row(55, 102)])
            .unwrap();

        f.orchestrator.begin(PartitionId(0), target_id()).await.unwrap();
        f.orchestrator.advance(PartitionId(0)).await.unwrap(); // preparing

        let mut chunks = Vec::new();
        loop {
            let before = f.target.row_count();
            let job = f.orchestrator.advance(PartitionId(0)).await.unwrap();
            chunks.push(f.target.row_count() - before);
            if job.phase != MigrationPhase::Copying {
                break;
            }
        }
        // A two-row scan ending in key 55 copies all three of its rows at once
        assert!(chunks.contains(&3));
        assert_eq!(chunks.iter().sum::<usize>(), 12);

        let job = f.orchestrator.run(PartitionId(0)).await.unwrap();
        assert_eq!(job.row_count_target, Some(12));
    }

    #[tokio::test]
    async fn test_second_migration_conflicts() {
        let f = fixture(small_batches());
        f.orchestrator.begin(PartitionId(0), target_id()).await.unwrap();

        let again = f.orchestrator.begin(PartitionId(0), BackendId::from("primary")).await;
        assert!(matches!(again, Err(TierError::CatalogConflict { .. })));
    }

    #[tokio::test]
    async fn test_verification_failure_rolls_back() {
        let f = fixture(MigrationConfig::default());
        f.target.drop_next_ingested(1);

        f.orchestrator.begin(PartitionId(0), target_id()).await.unwrap();
        let result = f.orchestrator.run(PartitionId(0)).await;
        assert!(matches!(result, Err(TierError::VerificationFailed { .. })));

        let partition = f.catalog.snapshot().partition(PartitionId(0)).cloned().unwrap();
        assert_eq!(partition.backend, BackendId::from("archive-b"));
        assert_eq!(partition.state, PartitionState::Active);
        assert_eq!(f.target.row_count(), 0);
        assert_eq!(f.source.row_count(), 9);

        let job = f.orchestrator.status(PartitionId(0)).unwrap();
        assert_eq!(job.phase, MigrationPhase::Failed);
        assert!(job.failure.unwrap().contains("Verification failed"));
        assert_eq!(f.stats.snapshot().migrations_failed, 1);
    }

    #[tokio::test]
    async fn test_unreachable_target_fails_start() {
        let f = fixture(small_batches());
        f.target.set_available(false);

        let result = f
            .orchestrator
            .start_migration(PartitionId(0), target_id())
            .await;
        assert!(matches!(result, Err(TierError::TargetUnreachable { .. })));
        assert_eq!(
            f.catalog.snapshot().partition(PartitionId(0)).unwrap().state,
            PartitionState::Active
        );
    }

    #[tokio::test]
    async fn test_abort_during_copying_restores_source() {
        let f = fixture(small_batches());
        f.orchestrator.begin(PartitionId(0), target_id()).await.unwrap();
        f.orchestrator.advance(PartitionId(0)).await.unwrap();
        f.orchestrator.advance(PartitionId(0)).await.unwrap();
        assert!(f.target.row_count() > 0);

        let job = f.orchestrator.abort_migration(PartitionId(0)).await.unwrap();
        assert_eq!(job.phase, MigrationPhase::Failed);
        assert_eq!(f.target.row_count(), 0);
        assert_eq!(
            f.catalog.snapshot().partition(PartitionId(0)).unwrap().backend,
            BackendId::from("archive-b")
        );
        assert_eq!(f.stats.snapshot().migrations_aborted, 1);
        assert!(matches!(
            f.orchestrator.advance(PartitionId(0)).await,
            Err(TierError::MigrationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_abort_rejected_after_cutover() {
        let f = fixture(small_batches().with_decommission_grace(Duration::from_secs(60)));
        f.orchestrator.begin(PartitionId(0), target_id()).await.unwrap();
        let mut job = f.orchestrator.advance(PartitionId(0)).await.unwrap();
        while job.phase != MigrationPhase::Decommissioning {
            job = f.orchestrator.advance(PartitionId(0)).await.unwrap();
        }

        let result = f.orchestrator.abort_migration(PartitionId(0)).await;
        assert!(matches!(result, Err(TierError::MigrationRejected(_))));
        // Source is kept during the grace period
        assert_eq!(f.source.row_count(), 9);
    }

    #[tokio::test]
    async fn test_begin_rejected_while_decommissioning() {
        let f = fixture(small_batches().with_decommission_grace(Duration::from_secs(60)));
        f.orchestrator.begin(PartitionId(0), target_id()).await.unwrap();
        let mut job = f.orchestrator.advance(PartitionId(0)).await.unwrap();
        while job.phase != MigrationPhase::Decommissioning {
            job = f.orchestrator.advance(PartitionId(0)).await.unwrap();
        }
        // Routing already moved, so the catalog alone would accept a new job
        assert_eq!(
            f.catalog.snapshot().partition(PartitionId(0)).unwrap().state,
            PartitionState::Active
        );

        let back = f
            .orchestrator
            .begin(PartitionId(0), BackendId::from("archive-b"))
            .await;
        assert!(matches!(back, Err(TierError::CatalogConflict { .. })));

        let status = f.orchestrator.status(PartitionId(0)).unwrap();
        assert_eq!(status.id, job.id);
        assert_eq!(status.phase, MigrationPhase::Decommissioning);
        assert_eq!(
            f.catalog.snapshot().partition(PartitionId(0)).unwrap().state,
            PartitionState::Active
        );
        assert_eq!(f.target.row_count(), 9);
    }

    #[tokio::test]
    async fn test_decommission_retries_while_source_is_down() {
        let f = fixture(small_batches());
        f.orchestrator.begin(PartitionId(0), target_id()).await.unwrap();
        let mut job = f.orchestrator.advance(PartitionId(0)).await.unwrap();
        while job.phase != MigrationPhase::Decommissioning {
            job = f.orchestrator.advance(PartitionId(0)).await.unwrap();
        }

        f.source.set_available(false);
        let job = f.orchestrator.advance(PartitionId(0)).await.unwrap();
        assert_eq!(job.phase, MigrationPhase::Decommissioning);
        assert_eq!(f.source.row_count(), 9);

        let orchestrator = Arc::clone(&f.orchestrator);
        let driver = tokio::spawn(async move { orchestrator.run(PartitionId(0)).await });
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!driver.is_finished());

        f.source.set_available(true);
        let job = driver.await.unwrap().unwrap();
        assert_eq!(job.phase, MigrationPhase::Done);
        assert_eq!(f.source.row_count(), 0);
        assert_eq!(f.target.row_count(), 9);
        assert_eq!(f.orchestrator.history(), vec![job]);
    }

    #[tokio::test]
    async fn test_cutover_waits_for_writers() {
        let f = fixture(small_batches());
        f.orchestrator.begin(PartitionId(0), target_id()).await.unwrap();
        let mut job = f.orchestrator.advance(PartitionId(0)).await.unwrap();
        while job.phase != MigrationPhase::Cutover {
            job = f.orchestrator.advance(PartitionId(0)).await.unwrap();
        }

        let writer = f
            .gates
            .enter(PartitionId(0), Duration::from_millis(10))
            .await
            .unwrap();
        let job = f.orchestrator.advance(PartitionId(0)).await.unwrap();
        assert_eq!(job.phase, MigrationPhase::Cutover);

        drop(writer);
        let job = f.orchestrator.advance(PartitionId(0)).await.unwrap();
        assert_eq!(job.phase, MigrationPhase::Decommissioning);
    }

    #[tokio::test]
    async fn test_writes_after_verification_are_synced_at_cutover() {
        let f = fixture(small_batches());
        f.orchestrator.begin(PartitionId(0), target_id()).await.unwrap();
        let mut job = f.orchestrator.advance(PartitionId(0)).await.unwrap();
        while job.phase != MigrationPhase::Cutover {
            job = f.orchestrator.advance(PartitionId(0)).await.unwrap();
        }

        // A write routed to the source before the pause
        f.source.load(vec![row(95, 1)]).unwrap();

        let job = f.orchestrator.run(PartitionId(0)).await.unwrap();
        assert_eq!(job.phase, MigrationPhase::Done);
        assert_eq!(job.row_count_target, Some(10));
        assert_eq!(f.target.row_count(), 10);
    }

    #[tokio::test]
    async fn test_writes_during_copy_trigger_recopy() {
        let f = fixture(small_batches());
        f.orchestrator.begin(PartitionId(0), target_id()).await.unwrap();
        f.orchestrator.advance(PartitionId(0)).await.unwrap();
        f.orchestrator.advance(PartitionId(0)).await.unwrap();

        // Lands in the already copied prefix
        f.source.load(vec![row(5, 1)]).unwrap();

        let job = f.orchestrator.run(PartitionId(0)).await.unwrap();
        assert_eq!(job.phase, MigrationPhase::Done);
        assert_eq!(f.target.row_count(), 10);
    }

    #[tokio::test]
    async fn test_decommission_waits_for_old_snapshots() {
        let f = fixture(small_batches());
        let lease = f.snapshots.lease(f.catalog.version());

        f.orchestrator.begin(PartitionId(0), target_id()).await.unwrap();
        let mut job = f.orchestrator.advance(PartitionId(0)).await.unwrap();
        while job.phase != MigrationPhase::Decommissioning {
            job = f.orchestrator.advance(PartitionId(0)).await.unwrap();
        }

        let job = f.orchestrator.advance(PartitionId(0)).await.unwrap();
        assert_eq!(job.phase, MigrationPhase::Decommissioning);
        assert_eq!(f.source.row_count(), 9);

        drop(lease);
        let job = f.orchestrator.advance(PartitionId(0)).await.unwrap();
        assert_eq!(job.phase, MigrationPhase::Done);
        assert_eq!(f.source.row_count(), 0);
    }
}
