//! Query results returned to callers

use crate::merge::MergedOutput;
use crate::types::QueryId;
use futures::stream::{self, BoxStream};
use serde::Serialize;
use tier_core::{PartitionId, Row, Value};

/// Whether every routed partition contributed to a result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Completeness {
    Complete,
    /// Some partitions could not answer under the best-effort policy
    Partial { unavailable: Vec<PartitionId> },
}

/// Execution statistics for one query
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionStats {
    /// Catalog version the query was routed against
    pub catalog_version: u64,
    /// Fragments sent to backends
    pub fragments_dispatched: usize,
    /// Fragments never sent because enough rows were already in hand
    pub fragments_skipped: usize,
    /// Retried fragment attempts
    pub retries: u32,
    /// Wall-clock execution time
    pub elapsed_ms: u64,
}

/// Result of a federated query
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub query_id: QueryId,
    pub output: MergedOutput,
    pub completeness: Completeness,
    pub stats: ExecutionStats,
}

impl QueryResult {
    /// Rows of the result. For aggregates these are the finished aggregate
    /// rows (group values followed by the aggregate value).
    pub fn rows(&self) -> &[Row] {
        match &self.output {
            MergedOutput::Rows(rows) | MergedOutput::Aggregate(rows) => rows,
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows().len()
    }

    /// The scalar value of an ungrouped aggregate
    pub fn aggregate_value(&self) -> Option<&Value> {
        match &self.output {
            MergedOutput::Aggregate(rows) if rows.len() == 1 && rows[0].len() == 1 => {
                rows[0].first()
            }
            _ => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completeness == Completeness::Complete
    }

    pub fn unavailable_partitions(&self) -> &[PartitionId] {
        match &self.completeness {
            Completeness::Complete => &[],
            Completeness::Partial { unavailable } => unavailable,
        }
    }

    /// Consume the result as a stream of rows
    pub fn into_stream(self) -> BoxStream<'static, Row> {
        let rows = match self.output {
            MergedOutput::Rows(rows) | MergedOutput::Aggregate(rows) => rows,
        };
        Box::pin(stream::iter(rows))
    }
}
