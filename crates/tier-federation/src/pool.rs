//! Connection pooling for backends
//!
//! One bounded pool per backend. Checkout is guarded by a semaphore so
//! concurrency never exceeds `max_size`; the whole checkout, including
//! waiting for a slot, is bounded by the caller's timeout. Idle sessions
//! are probed before reuse and a session that failed, or was abandoned
//! mid-request, is closed instead of returned.

use crate::config::PoolConfig;
use crate::stats::{PoolSnapshot, PoolStats};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tier_core::{
    BackendAdapter, BackendId, BackendSession, Fragment, FragmentResult, KeyRange,
    RangeChecksum, Result, Row, TierError,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::debug;

struct IdleSession {
    session: Box<dyn BackendSession>,
    idle_since: Instant,
}

/// A pool of reusable sessions to one backend
pub struct ConnectionPool {
    adapter: Arc<dyn BackendAdapter>,
    backend: BackendId,
    config: PoolConfig,
    /// Idle sessions, most recently returned at the back
    idle: Mutex<VecDeque<IdleSession>>,
    semaphore: Arc<Semaphore>,
    max_size: usize,
    stats: PoolStats,
}

impl ConnectionPool {
    pub fn new(adapter: Arc<dyn BackendAdapter>, config: PoolConfig) -> Self {
        let max_size = config.max_size.max(1);
        Self {
            backend: adapter.backend_ref().id.clone(),
            adapter,
            idle: Mutex::new(VecDeque::with_capacity(max_size)),
            semaphore: Arc::new(Semaphore::new(max_size)),
            max_size,
            config,
            stats: PoolStats::default(),
        }
    }

    pub fn backend(&self) -> &BackendId {
        &self.backend
    }

    pub fn adapter(&self) -> &Arc<dyn BackendAdapter> {
        &self.adapter
    }

    /// Check out a session within `timeout`.
    ///
    /// Returns [`TierError::PoolExhausted`] if no slot frees up in time.
    /// Idle sessions are health-checked first; sessions failing the probe
    /// are closed and the next one (or a fresh connection) is tried. Probing
    /// and connecting share the same deadline; running out of time there is
    /// reported as `BackendUnreachable`.
    pub async fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<PooledSession> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;
        let permit =
            match tokio::time::timeout_at(deadline, self.semaphore.clone().acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                _ => {
                    self.stats.record_exhausted();
                    return Err(TierError::PoolExhausted {
                        backend: self.backend.to_string(),
                        waited_ms: started.elapsed().as_millis() as u64,
                    });
                }
            };

        match tokio::time::timeout_at(deadline, self.checkout(permit)).await {
            Ok(result) => result,
            Err(_) => Err(TierError::unreachable(
                self.backend.as_str(),
                format!("no usable session within {}ms", timeout.as_millis()),
            )),
        }
    }

    async fn checkout(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> Result<PooledSession> {
        loop {
            let candidate = self.idle.lock().pop_back();
            let Some(mut idle) = candidate else { break };

            let probe = tokio::time::timeout(
                self.config.health_check_timeout(),
                idle.session.health_check(),
            )
            .await;
            match probe {
                Ok(Ok(())) => {
                    self.stats.record_reused();
                    return Ok(PooledSession::new(idle.session, Arc::clone(self), permit));
                }
                Ok(Err(e)) => {
                    debug!("Discarding idle session to {}: {}", self.backend, e);
                    self.stats.record_discarded();
                }
                Err(_) => {
                    debug!("Discarding idle session to {}: probe timed out", self.backend);
                    self.stats.record_discarded();
                }
            }
        }

        let session = match tokio::time::timeout(self.config.connect_timeout(), self.adapter.connect())
            .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(TierError::unreachable(
                    self.backend.as_str(),
                    format!("connect timed out after {}ms", self.config.connect_timeout_ms),
                ))
            }
        };
        self.stats.record_created();
        Ok(PooledSession::new(session, Arc::clone(self), permit))
    }

    fn put_back(&self, session: Box<dyn BackendSession>) {
        self.idle.lock().push_back(IdleSession {
            session,
            idle_since: Instant::now(),
        });
    }

    /// Close idle sessions above `min_idle` that have been idle longer than
    /// `idle_timeout`. Returns the number closed.
    pub fn reap_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout();
        let mut idle = self.idle.lock();
        let mut reaped = 0;
        while idle.len() > self.config.min_idle {
            match idle.front() {
                Some(oldest) if oldest.idle_since.elapsed() >= idle_timeout => {
                    idle.pop_front();
                    reaped += 1;
                }
                _ => break,
            }
        }
        drop(idle);

        if reaped > 0 {
            self.stats.record_reaped(reaped as u64);
            debug!("Reaped {} idle sessions to {}", reaped, self.backend);
        }
        reaped
    }

    /// Run [`reap_idle`](Self::reap_idle) every `interval` until the pool is
    /// dropped
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let pool: Weak<ConnectionPool> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match pool.upgrade() {
                    Some(pool) => {
                        pool.reap_idle();
                    }
                    None => break,
                }
            }
        })
    }

    /// Current number of idle sessions sitting in the pool
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Sessions currently checked out
    pub fn in_use(&self) -> usize {
        self.max_size - self.semaphore.available_permits()
    }

    pub fn stats(&self) -> PoolSnapshot {
        self.stats.snapshot(self.idle_count(), self.in_use(), self.max_size)
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("backend", &self.backend)
            .field("max_size", &self.max_size)
            .field("idle", &self.idle_count())
            .finish()
    }
}

/// A session checked out from a [`ConnectionPool`].
///
/// When dropped the session goes back to the pool, unless a request on it
/// failed at the backend or was still in flight (cancelled by a timeout),
/// in which case it is closed.
pub struct PooledSession {
    session: Option<Box<dyn BackendSession>>,
    pool: Arc<ConnectionPool>,
    in_flight: bool,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledSession {
    fn new(
        session: Box<dyn BackendSession>,
        pool: Arc<ConnectionPool>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            session: Some(session),
            pool,
            in_flight: false,
            broken: false,
            _permit: permit,
        }
    }

    pub fn backend(&self) -> &BackendId {
        self.pool.backend()
    }

    /// Close the session instead of returning it to the pool
    pub fn discard(mut self) {
        self.broken = true;
    }

    fn begin(&mut self) -> Result<&mut Box<dyn BackendSession>> {
        self.in_flight = true;
        let backend = self.pool.backend.as_str();
        self.session
            .as_mut()
            .ok_or_else(|| TierError::unreachable(backend, "session already closed"))
    }

    fn finish<T>(&mut self, result: Result<T>) -> Result<T> {
        self.in_flight = false;
        if let Err(e) = &result {
            if e.is_backend_failure() {
                self.broken = true;
            }
        }
        result
    }
}

#[async_trait]
impl BackendSession for PooledSession {
    async fn execute(
        &mut self,
        fragment: &Fragment,
        deadline: tokio::time::Instant,
    ) -> Result<FragmentResult> {
        let result = self.begin()?.execute(fragment, deadline).await;
        self.finish(result)
    }

    async fn health_check(&mut self) -> Result<()> {
        let result = self.begin()?.health_check().await;
        self.finish(result)
    }

    async fn ingest(&mut self, range: KeyRange, rows: Vec<Row>) -> Result<u64> {
        let result = self.begin()?.ingest(range, rows).await;
        self.finish(result)
    }

    async fn checksum(&mut self, range: KeyRange) -> Result<RangeChecksum> {
        let result = self.begin()?.checksum(range).await;
        self.finish(result)
    }

    async fn purge(&mut self, range: KeyRange) -> Result<u64> {
        let result = self.begin()?.purge(range).await;
        self.finish(result)
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            if self.in_flight || self.broken {
                debug!(
                    "Closing session to {} (in_flight={}, broken={})",
                    self.pool.backend, self.in_flight, self.broken
                );
                self.pool.stats.record_discarded();
            } else {
                self.pool.put_back(session);
            }
        }
    }
}

/// The pools of every registered backend
#[derive(Debug)]
pub struct PoolRegistry {
    pools: DashMap<BackendId, Arc<ConnectionPool>>,
    config: PoolConfig,
}

impl PoolRegistry {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            pools: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Create a pool for `adapter`. Fails if its backend already has one.
    pub fn register(&self, adapter: Arc<dyn BackendAdapter>) -> Result<Arc<ConnectionPool>> {
        let id = adapter.backend_ref().id.clone();
        match self.pools.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                Err(TierError::BackendAlreadyRegistered(entry.key().to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let pool = Arc::new(ConnectionPool::new(adapter, self.config.clone()));
                entry.insert(Arc::clone(&pool));
                Ok(pool)
            }
        }
    }

    pub fn get(&self, backend: &BackendId) -> Result<Arc<ConnectionPool>> {
        self.pools
            .get(backend)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| TierError::BackendNotFound(backend.to_string()))
    }

    pub fn contains(&self, backend: &BackendId) -> bool {
        self.pools.contains_key(backend)
    }

    /// All pools, ordered by backend id
    pub fn pools(&self) -> Vec<Arc<ConnectionPool>> {
        let mut pools: Vec<_> = self.pools.iter().map(|p| Arc::clone(p.value())).collect();
        pools.sort_by(|a, b| a.backend().cmp(b.backend()));
        pools
    }

    pub fn reap_all(&self) -> usize {
        self.pools.iter().map(|p| p.reap_idle()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tier_core::{BackendCapabilities, DataType, Field, PartitionId, Schema, StorageKind};
    use tier_storage::MemoryBackend;

    fn schema() -> Schema {
        Schema::new(vec![Field::new("day", DataType::Int64, false)], "day").unwrap()
    }

    fn memory() -> MemoryBackend {
        MemoryBackend::named(
            "archive-a",
            StorageKind::Remote,
            BackendCapabilities::full(),
            schema(),
        )
    }

    fn pool(backend: &MemoryBackend, config: PoolConfig) -> Arc<ConnectionPool> {
        Arc::new(ConnectionPool::new(Arc::new(backend.clone()), config))
    }

    #[tokio::test]
    async fn test_sessions_are_reused() {
        let backend = memory();
        let pool = pool(&backend, PoolConfig::default());

        let session = pool.acquire(Duration::from_millis(100)).await.unwrap();
        assert_eq!(pool.in_use(), 1);
        drop(session);
        assert_eq!(pool.idle_count(), 1);

        let _session = pool.acquire(Duration::from_millis(100)).await.unwrap();
        assert_eq!(backend.sessions_opened(), 1);
        assert_eq!(pool.stats().reused, 1);
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_exhausted() {
        let backend = memory();
        let pool = pool(&backend, PoolConfig::default().with_max_size(1));

        let _held = pool.acquire(Duration::from_millis(100)).await.unwrap();
        let result = pool.acquire(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(TierError::PoolExhausted { .. })));
        assert_eq!(pool.stats().exhausted, 1);
    }

    #[tokio::test]
    async fn test_waiter_gets_released_session() {
        let backend = memory();
        let pool = pool(&backend, PoolConfig::default().with_max_size(1));

        let held = pool.acquire(Duration::from_millis(100)).await.unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(Duration::from_secs(2)).await.is_ok() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        assert!(waiter.await.unwrap());
        assert_eq!(backend.sessions_opened(), 1);
    }

    #[tokio::test]
    async fn test_failed_session_is_discarded() {
        let backend = memory();
        let pool = pool(&backend, PoolConfig::default());
        let fragment = Fragment::scan(
            PartitionId(0),
            Arc::new(backend.backend_ref().clone()),
            KeyRange::full(),
        );

        let mut session = pool.acquire(Duration::from_millis(100)).await.unwrap();
        backend.fail_next(1);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        assert!(session.execute(&fragment, deadline).await.is_err());
        drop(session);

        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.stats().discarded, 1);
    }

    #[tokio::test]
    async fn test_cancelled_request_discards_session() {
        let backend = memory();
        backend.set_latency(Duration::from_millis(500));
        let pool = pool(&backend, PoolConfig::default());
        let fragment = Fragment::scan(
            PartitionId(0),
            Arc::new(backend.backend_ref().clone()),
            KeyRange::full(),
        );

        let mut session = pool.acquire(Duration::from_millis(100)).await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let timed_out =
            tokio::time::timeout(Duration::from_millis(20), session.execute(&fragment, deadline))
                .await;
        assert!(timed_out.is_err());
        drop(session);

        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_unhealthy_idle_session_replaced() {
        let backend = memory();
        let pool = pool(&backend, PoolConfig::default());

        drop(pool.acquire(Duration::from_millis(100)).await.unwrap());
        backend.set_available(false);
        assert!(pool.acquire(Duration::from_millis(100)).await.is_err());
        assert_eq!(pool.stats().discarded, 1);

        backend.set_available(true);
        assert!(pool.acquire(Duration::from_millis(100)).await.is_ok());
        assert_eq!(backend.sessions_opened(), 2);
    }

    #[tokio::test]
    async fn test_slow_connect_bounded_by_acquire_timeout() {
        let backend = memory();
        backend.set_connect_delay(Duration::from_millis(500));
        let pool = pool(&backend, PoolConfig::default());

        let started = Instant::now();
        let result = pool.acquire(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(TierError::BackendUnreachable { .. })));
        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(pool.in_use(), 0);

        backend.set_connect_delay(Duration::ZERO);
        assert!(pool.acquire(Duration::from_millis(50)).await.is_ok());
    }

    #[tokio::test]
    async fn test_reap_idle_keeps_min_idle() {
        let backend = memory();
        let pool = pool(
            &backend,
            PoolConfig::default()
                .with_min_idle(1)
                .with_idle_timeout(Duration::ZERO),
        );

        let a = pool.acquire(Duration::from_millis(100)).await.unwrap();
        let b = pool.acquire(Duration::from_millis(100)).await.unwrap();
        let c = pool.acquire(Duration::from_millis(100)).await.unwrap();
        drop((a, b, c));
        assert_eq!(pool.idle_count(), 3);

        assert_eq!(pool.reap_idle(), 2);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_registry_rejects_duplicates() {
        let registry = PoolRegistry::new(PoolConfig::default());
        let backend = memory();
        registry.register(Arc::new(backend.clone())).unwrap();
        assert!(matches!(
            registry.register(Arc::new(backend)),
            Err(TierError::BackendAlreadyRegistered(_))
        ));
        assert!(registry.get(&BackendId::from("archive-a")).is_ok());
        assert!(registry.get(&BackendId::from("missing")).is_err());
    }
}
