//! Fan-out executor
//!
//! Dispatches the fragments of one query to their backends through the
//! connection pools, each attempt under its own timeout derived from the
//! query deadline. Dropping the returned future cancels every outstanding
//! fragment; sessions abandoned mid-request are closed by the pool.

use crate::config::ExecutorConfig;
use crate::fault::{FaultTracker, RetryPolicy};
use crate::merge::FragmentOutput;
use crate::pool::{ConnectionPool, PoolRegistry};
use crate::router::{ExecutionMode, RoutedQuery};
use crate::stats::FederationStats;
use crate::types::FailurePolicy;
use futures::future::{join_all, try_join_all};
use futures::stream::{FuturesOrdered, StreamExt};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tier_core::{BackendSession, Fragment, FragmentResult, PartitionId, Result, TierError};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Raw outcome of executing a routed query, before merging
#[derive(Debug, Default)]
pub struct Execution {
    /// Results of the fragments that answered, in fragment order
    pub outputs: Vec<FragmentOutput>,
    /// Partitions that could not answer (best-effort only)
    pub unavailable: Vec<PartitionId>,
    pub dispatched: usize,
    pub skipped: usize,
    pub retries: u32,
}

/// Executes routed queries against pooled backends
pub struct FanOutExecutor {
    pools: Arc<PoolRegistry>,
    faults: Arc<FaultTracker>,
    stats: Arc<FederationStats>,
    retry: RetryPolicy,
    config: ExecutorConfig,
}

impl FanOutExecutor {
    pub fn new(
        pools: Arc<PoolRegistry>,
        faults: Arc<FaultTracker>,
        stats: Arc<FederationStats>,
        retry: RetryPolicy,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            pools,
            faults,
            stats,
            retry,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute every fragment of `routed` before `deadline`
    pub async fn execute(
        &self,
        routed: &RoutedQuery,
        policy: FailurePolicy,
        deadline: Instant,
    ) -> Result<Execution> {
        if routed.is_empty() {
            return Ok(Execution::default());
        }
        debug!(
            "Executing {} fragments ({:?}, {})",
            routed.fragments.len(),
            routed.mode,
            policy
        );

        let retries = AtomicU32::new(0);
        let mut execution = match routed.mode {
            ExecutionMode::Parallel => {
                self.execute_parallel(&routed.fragments, policy, deadline, &retries)
                    .await?
            }
            ExecutionMode::OrderedLimit { limit } => {
                self.execute_ordered(&routed.fragments, limit, policy, deadline, &retries)
                    .await?
            }
        };
        execution.retries = retries.load(Ordering::Relaxed);

        self.stats.record_dispatched(execution.dispatched as u64);
        if execution.skipped > 0 {
            self.stats.record_skipped(execution.skipped as u64);
        }
        Ok(execution)
    }

    async fn execute_parallel(
        &self,
        fragments: &[Fragment],
        policy: FailurePolicy,
        deadline: Instant,
        retries: &AtomicU32,
    ) -> Result<Execution> {
        let runs = fragments
            .iter()
            .map(|fragment| self.run_fragment(fragment, deadline, retries));

        let mut execution = Execution {
            dispatched: fragments.len(),
            ..Default::default()
        };

        match policy {
            FailurePolicy::FailFast => {
                // The first error drops the remaining fragment futures
                let results = try_join_all(runs).await?;
                execution.outputs = fragments
                    .iter()
                    .zip(results)
                    .map(|(fragment, result)| output(fragment, result))
                    .collect();
            }
            FailurePolicy::BestEffort => {
                for (fragment, result) in fragments.iter().zip(join_all(runs).await) {
                    match result {
                        Ok(result) => execution.outputs.push(output(fragment, result)),
                        Err(e) => record_gap(&mut execution, fragment, e)?,
                    }
                }
            }
        }
        Ok(execution)
    }

    /// Visit fragments in order, keeping at most `ordered_prefetch` in
    /// flight, and stop once `limit` rows are in hand. Fragments are disjoint
    /// and sorted, so no later fragment can contribute a leading row.
    async fn execute_ordered(
        &self,
        fragments: &[Fragment],
        limit: usize,
        policy: FailurePolicy,
        deadline: Instant,
        retries: &AtomicU32,
    ) -> Result<Execution> {
        let window = self.config.ordered_prefetch.max(1);
        let mut execution = Execution::default();
        let mut pending = FuturesOrdered::new();
        let mut next = 0;
        let mut rows_in_hand = 0;

        loop {
            while next < fragments.len() && pending.len() < window {
                let fragment = &fragments[next];
                pending.push_back(async move {
                    (fragment, self.run_fragment(fragment, deadline, retries).await)
                });
                next += 1;
            }

            let Some((fragment, result)) = pending.next().await else {
                break;
            };
            match result {
                Ok(result) => {
                    rows_in_hand += result.row_count();
                    execution.outputs.push(output(fragment, result));
                }
                Err(e) if policy == FailurePolicy::BestEffort => {
                    record_gap(&mut execution, fragment, e)?
                }
                Err(e) => return Err(e),
            }

            if rows_in_hand >= limit {
                break;
            }
        }

        execution.dispatched = next;
        execution.skipped = fragments.len() - next;
        if execution.skipped > 0 {
            debug!(
                "Ordered scan satisfied {} rows after {} of {} fragments",
                limit,
                next,
                fragments.len()
            );
        }
        Ok(execution)
    }

    /// Run one fragment, retrying unreachable backends with backoff
    async fn run_fragment(
        &self,
        fragment: &Fragment,
        deadline: Instant,
        retries: &AtomicU32,
    ) -> Result<FragmentResult> {
        let backend = &fragment.backend.id;
        let pool = self.pools.get(backend)?;
        let max_attempts = self.retry.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let backoff = self.retry.backoff(attempt);
            if !backoff.is_zero() {
                tokio::time::sleep_until((Instant::now() + backoff).min(deadline)).await;
            }

            match self.attempt(&pool, fragment, deadline).await {
                Ok(result) => {
                    self.faults.record_success(backend);
                    return Ok(result);
                }
                Err(e) if e.is_backend_failure() => {
                    self.faults.record_failure(backend, &e.to_string());
                    if !e.is_retryable() || attempt >= max_attempts || Instant::now() >= deadline {
                        return Err(e);
                    }
                    warn!(
                        "Fragment {} attempt {}/{} failed: {}; retrying",
                        fragment, attempt, max_attempts, e
                    );
                    retries.fetch_add(1, Ordering::Relaxed);
                    self.stats.record_retry();
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt(
        &self,
        pool: &Arc<ConnectionPool>,
        fragment: &Fragment,
        deadline: Instant,
    ) -> Result<FragmentResult> {
        let backend = fragment.backend.id.as_str();
        let attempt_deadline = (Instant::now() + self.config.attempt_timeout()).min(deadline);
        let remaining = attempt_deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TierError::unreachable(backend, "query deadline exceeded"));
        }

        let acquire_timeout = self.pools.config().acquire_timeout().min(remaining);
        let mut session = pool.acquire(acquire_timeout).await?;

        match tokio::time::timeout_at(attempt_deadline, session.execute(fragment, attempt_deadline))
            .await
        {
            Ok(result) => result,
            // The in-flight session is closed when dropped
            Err(_) => Err(TierError::unreachable(
                backend,
                format!("no response within {}ms", remaining.as_millis()),
            )),
        }
    }
}

fn output(fragment: &Fragment, result: FragmentResult) -> FragmentOutput {
    FragmentOutput {
        partition_id: fragment.partition_id,
        ordered: fragment.order.is_some(),
        result,
    }
}

/// Record a best-effort gap. Only backend failures become gaps; local
/// errors such as pool exhaustion still fail the query.
fn record_gap(execution: &mut Execution, fragment: &Fragment, error: TierError) -> Result<()> {
    if !error.is_backend_failure() {
        return Err(error);
    }
    warn!(
        "Partition {} unavailable on {}: {}",
        fragment.partition_id, fragment.backend.id, error
    );
    execution.unavailable.push(fragment.partition_id);
    Ok(())
}

/// Deadline `timeout` from now
pub fn deadline_after(timeout: Duration) -> Instant {
    Instant::now() + timeout
}
