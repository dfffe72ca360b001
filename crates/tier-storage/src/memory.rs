//! In-memory storage tier
//!
//! Provides an Arrow-backed Backend Adapter that executes fragments over
//! `RecordBatch`es held in memory. Faults (unavailability, latency, failed
//! requests and silently dropped writes) can be injected to exercise the
//! federation layer's failure handling.

use arrow::array::{Array, BooleanArray, Int64Array};
use arrow::compute::filter_record_batch;
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tier_core::{
    record_batch_to_rows, rows_to_record_batch, BackendAdapter, BackendCapabilities,
    BackendRef, BackendSession, BoundAggregation, Fragment, FragmentResult, KeyRange,
    PartialAggregate, RangeChecksum, Result, Row, Schema, SortDirection, StorageKind,
    TierError,
};
use tokio::time::Instant;
use tracing::debug;

/// In-memory backend holding one relation's rows as record batches
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<MemoryStore>,
}

struct MemoryStore {
    backend: BackendRef,
    schema: Schema,
    batches: RwLock<Vec<RecordBatch>>,
    available: AtomicBool,
    latency_ms: AtomicU64,
    connect_delay_ms: AtomicU64,
    fail_next: AtomicU64,
    drop_next_ingested: AtomicU64,
    executions: AtomicU64,
    sessions_opened: AtomicU64,
}

impl MemoryBackend {
    /// Create a new empty memory backend
    pub fn new(backend: BackendRef, schema: Schema) -> Self {
        Self {
            inner: Arc::new(MemoryStore {
                backend,
                schema,
                batches: RwLock::new(Vec::new()),
                available: AtomicBool::new(true),
                latency_ms: AtomicU64::new(0),
                connect_delay_ms: AtomicU64::new(0),
                fail_next: AtomicU64::new(0),
                drop_next_ingested: AtomicU64::new(0),
                executions: AtomicU64::new(0),
                sessions_opened: AtomicU64::new(0),
            }),
        }
    }

    /// Shorthand for a backend with `mem://<id>` as its address
    pub fn named(
        id: &str,
        kind: StorageKind,
        capabilities: BackendCapabilities,
        schema: Schema,
    ) -> Self {
        Self::new(
            BackendRef::new(id, format!("mem://{}", id), kind, capabilities),
            schema,
        )
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    /// Seed rows directly, bypassing sessions and fault injection
    pub fn load(&self, rows: Vec<Row>) -> Result<()> {
        for row in &rows {
            self.inner.schema.validate_row(row)?;
        }
        self.inner.append(&rows)
    }

    /// Get total row count
    pub fn row_count(&self) -> usize {
        self.inner.batches.read().iter().map(|b| b.num_rows()).sum()
    }

    /// All stored rows in key order
    pub fn rows(&self) -> Result<Vec<Row>> {
        let mut rows = self.inner.rows_in(&KeyRange::full())?;
        self.inner.sort_by_key(&mut rows, SortDirection::Ascending);
        Ok(rows)
    }

    /// Mark the backend reachable or unreachable. While unreachable every
    /// request fails with `BackendUnreachable`.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Add a fixed delay to every fragment execution
    pub fn set_latency(&self, latency: Duration) {
        self.inner
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delay opening new sessions
    pub fn set_connect_delay(&self, delay: Duration) {
        self.inner
            .connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Fail the next `count` fragment executions
    pub fn fail_next(&self, count: u64) {
        self.inner.fail_next.store(count, Ordering::SeqCst);
    }

    /// Silently discard the next `count` ingested rows while still reporting
    /// them as written
    pub fn drop_next_ingested(&self, count: u64) {
        self.inner.drop_next_ingested.store(count, Ordering::SeqCst);
    }

    /// Number of fragments executed so far
    pub fn executions(&self) -> u64 {
        self.inner.executions.load(Ordering::SeqCst)
    }

    pub fn sessions_opened(&self) -> u64 {
        self.inner.sessions_opened.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("backend", &self.inner.backend.id)
            .field("rows", &self.row_count())
            .finish()
    }
}

#[async_trait]
impl BackendAdapter for MemoryBackend {
    fn backend_ref(&self) -> &BackendRef {
        &self.inner.backend
    }

    async fn connect(&self) -> Result<Box<dyn BackendSession>> {
        let delay = self.inner.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.inner.check_available()?;
        let session_id = self.inner.sessions_opened.fetch_add(1, Ordering::SeqCst);
        debug!(
            "Opened session {} on backend {}",
            session_id, self.inner.backend.id
        );
        Ok(Box::new(MemorySession {
            store: Arc::clone(&self.inner),
        }))
    }
}

impl MemoryStore {
    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TierError::unreachable(
                self.backend.id.as_str(),
                "backend is offline",
            ))
        }
    }

    fn append(&self, rows: &[Row]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let batch = rows_to_record_batch(&self.schema, rows)?;
        self.batches.write().push(batch);
        Ok(())
    }

    fn rows_in(&self, range: &KeyRange) -> Result<Vec<Row>> {
        let batches = self.batches.read().clone();
        let mut rows = Vec::new();
        for batch in &batches {
            for row in record_batch_to_rows(batch)? {
                if range.contains(self.schema.key_of(&row)?) {
                    rows.push(row);
                }
            }
        }
        Ok(rows)
    }

    fn sort_by_key(&self, rows: &mut [Row], direction: SortDirection) {
        let key = self.schema.key_index();
        match direction {
            SortDirection::Ascending => rows.sort_by(|a, b| a[key].cmp(&b[key])),
            SortDirection::Descending => rows.sort_by(|a, b| b[key].cmp(&a[key])),
        }
    }

    fn execute(&self, fragment: &Fragment) -> Result<FragmentResult> {
        let batches = self.batches.read().clone();
        let mut rows = Vec::new();
        for batch in &batches {
            for row in record_batch_to_rows(batch)? {
                if fragment.predicate.matches(&self.schema, &row)? {
                    rows.push(row);
                }
            }
        }

        if let Some(aggregation) = &fragment.aggregation {
            if !self.backend.capabilities.supports_pushdown_aggregation {
                return Err(TierError::InvalidQuery(format!(
                    "backend {} cannot compute aggregates",
                    self.backend.id
                )));
            }
            let bound = BoundAggregation::bind(aggregation, &self.schema)?;
            return Ok(FragmentResult::Partial(PartialAggregate::from_rows(
                &bound, &rows,
            )?));
        }

        if let Some(direction) = fragment.order {
            self.sort_by_key(&mut rows, direction);
        }
        if let Some(limit) = fragment.limit {
            rows.truncate(limit);
        }
        Ok(FragmentResult::Rows(rows))
    }

    fn purge(&self, range: &KeyRange) -> Result<u64> {
        let key_index = self.schema.key_index();
        let mut batches = self.batches.write();
        let mut removed = 0u64;
        let mut kept = Vec::with_capacity(batches.len());

        for batch in batches.iter() {
            let keys = batch
                .column(key_index)
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| TierError::Storage("key column is not int64".to_string()))?;
            let keep: BooleanArray = keys
                .iter()
                .map(|k| Some(!k.map_or(false, |k| range.contains(k))))
                .collect();
            let filtered = filter_record_batch(batch, &keep)?;
            removed += (batch.num_rows() - filtered.num_rows()) as u64;
            if filtered.num_rows() > 0 {
                kept.push(filtered);
            }
        }

        *batches = kept;
        Ok(removed)
    }
}

/// A session on a [`MemoryBackend`]
pub struct MemorySession {
    store: Arc<MemoryStore>,
}

#[async_trait]
impl BackendSession for MemorySession {
    async fn execute(&mut self, fragment: &Fragment, deadline: Instant) -> Result<FragmentResult> {
        self.store.check_available()?;

        let latency = self.store.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            let wake = Instant::now() + Duration::from_millis(latency);
            if wake > deadline {
                tokio::time::sleep_until(deadline).await;
                return Err(TierError::unreachable(
                    self.store.backend.id.as_str(),
                    "deadline exceeded",
                ));
            }
            tokio::time::sleep_until(wake).await;
        }

        // Availability may change while the request is in flight.
        self.store.check_available()?;

        let pending_failures = self.store.fail_next.load(Ordering::SeqCst);
        if pending_failures > 0
            && self
                .store
                .fail_next
                .compare_exchange(
                    pending_failures,
                    pending_failures - 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
        {
            return Err(TierError::unreachable(
                self.store.backend.id.as_str(),
                "injected failure",
            ));
        }

        self.store.executions.fetch_add(1, Ordering::SeqCst);
        self.store.execute(fragment)
    }

    async fn health_check(&mut self) -> Result<()> {
        self.store.check_available()
    }

    async fn ingest(&mut self, range: KeyRange, rows: Vec<Row>) -> Result<u64> {
        self.store.check_available()?;

        for row in &rows {
            self.store.schema.validate_row(row)?;
            let key = self.store.schema.key_of(row)?;
            if !range.contains(key) {
                return Err(TierError::InvalidRow(format!(
                    "key {} outside ingest range {}",
                    key, range
                )));
            }
        }

        let written = rows.len() as u64;
        let to_drop = self
            .store
            .drop_next_ingested
            .load(Ordering::SeqCst)
            .min(written);
        if to_drop > 0 {
            self.store
                .drop_next_ingested
                .fetch_sub(to_drop, Ordering::SeqCst);
        }

        self.store.append(&rows[to_drop as usize..])?;
        Ok(written)
    }

    async fn checksum(&mut self, range: KeyRange) -> Result<RangeChecksum> {
        self.store.check_available()?;
        let rows = self.store.rows_in(&range)?;
        Ok(RangeChecksum::of_rows(&rows))
    }

    async fn purge(&mut self, range: KeyRange) -> Result<u64> {
        self.store.check_available()?;
        let removed = self.store.purge(&range)?;
        debug!(
            "Purged {} rows in {} from backend {}",
            removed, range, self.store.backend.id
        );
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tier_core::{
        AggregateFunction, Aggregation, Condition, DataType, Field, FragmentPredicate,
        PartitionId, Value,
    };

    fn schema() -> Schema {
        Schema::new(
            vec![
                Field::new("day", DataType::Int64, false),
                Field::new("region", DataType::Utf8, true),
                Field::new("amount", DataType::Int64, true),
            ],
            "day",
        )
        .unwrap()
    }

    fn row(day: i64, region: &str, amount: i64) -> Row {
        vec![Value::Int64(day), Value::from(region), Value::Int64(amount)]
    }

    fn backend() -> MemoryBackend {
        let backend = MemoryBackend::named(
            "archive-a",
            StorageKind::Remote,
            BackendCapabilities::full(),
            schema(),
        );
        backend
            .load(vec![
                row(5, "eu", 10),
                row(1, "us", 20),
                row(3, "eu", 30),
                row(9, "us", 40),
            ])
            .unwrap();
        backend
    }

    fn fragment(backend: &MemoryBackend, range: KeyRange) -> Fragment {
        Fragment::scan(
            PartitionId(1),
            Arc::new(backend.backend_ref().clone()),
            range,
        )
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn test_ordered_scan_with_limit() {
        let backend = backend();
        let mut session = backend.connect().await.unwrap();

        let fragment = fragment(&backend, KeyRange::full())
            .ordered(SortDirection::Descending)
            .with_limit(2);
        let rows = session
            .execute(&fragment, far_deadline())
            .await
            .unwrap()
            .into_rows()
            .unwrap();

        assert_eq!(rows, vec![row(9, "us", 40), row(5, "eu", 10)]);
        assert_eq!(backend.executions(), 1);
    }

    #[tokio::test]
    async fn test_filters_and_pushed_aggregate() {
        let backend = backend();
        let mut session = backend.connect().await.unwrap();

        let mut fragment = fragment(&backend, KeyRange::bounded(0, 6));
        fragment.predicate = FragmentPredicate::new(
            vec![KeyRange::bounded(0, 6)],
            vec![Condition::eq("region", "eu")],
        );
        fragment.aggregation = Some(Aggregation::of(AggregateFunction::Sum, "amount"));

        let result = session.execute(&fragment, far_deadline()).await.unwrap();
        match result {
            FragmentResult::Partial(partial) => {
                assert_eq!(partial.finish(false), vec![vec![Value::Int64(40)]]);
            }
            other => panic!("expected partial aggregate, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ingest_checksum_purge() {
        let source = backend();
        let target = MemoryBackend::named(
            "archive-c",
            StorageKind::Remote,
            BackendCapabilities::full(),
            schema(),
        );
        let range = KeyRange::bounded(0, 6);

        let mut src = source.connect().await.unwrap();
        let mut dst = target.connect().await.unwrap();

        let rows = src
            .execute(&fragment(&source, range), far_deadline())
            .await
            .unwrap()
            .into_rows()
            .unwrap();
        assert_eq!(dst.ingest(range, rows).await.unwrap(), 3);
        assert_eq!(
            src.checksum(range).await.unwrap(),
            dst.checksum(range).await.unwrap()
        );

        assert_eq!(dst.purge(range).await.unwrap(), 3);
        assert_eq!(target.row_count(), 0);
        assert_eq!(source.row_count(), 4);
    }

    #[tokio::test]
    async fn test_ingest_rejects_rows_outside_range() {
        let backend = backend();
        let mut session = backend.connect().await.unwrap();
        let result = session
            .ingest(KeyRange::bounded(0, 2), vec![row(7, "eu", 1)])
            .await;
        assert!(matches!(result, Err(TierError::InvalidRow(_))));
    }

    #[tokio::test]
    async fn test_dropped_writes_change_checksum() {
        let backend = backend();
        backend.drop_next_ingested(1);
        let mut session = backend.connect().await.unwrap();

        let range = KeyRange::bounded(100, 200);
        let written = session
            .ingest(range, vec![row(100, "eu", 1), row(101, "eu", 2)])
            .await
            .unwrap();
        assert_eq!(written, 2);
        assert_eq!(session.checksum(range).await.unwrap().row_count, 1);
    }

    #[tokio::test]
    async fn test_faults() {
        let backend = backend();
        let mut session = backend.connect().await.unwrap();

        backend.fail_next(1);
        let fragment = fragment(&backend, KeyRange::full());
        assert!(session.execute(&fragment, far_deadline()).await.is_err());
        assert!(session.execute(&fragment, far_deadline()).await.is_ok());

        backend.set_available(false);
        assert!(session.health_check().await.is_err());
        assert!(backend.connect().await.is_err());

        backend.set_available(true);
        backend.set_latency(Duration::from_millis(200));
        let deadline = Instant::now() + Duration::from_millis(20);
        let result = session.execute(&fragment, deadline).await;
        assert!(matches!(result, Err(TierError::BackendUnreachable { .. })));
    }
}
