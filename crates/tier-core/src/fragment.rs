//! Per-partition units of work derived from a query.

use crate::aggregate::PartialAggregate;
use crate::backend::BackendRef;
use crate::error::Result;
use crate::predicate::Condition;
use crate::query::{Aggregation, SortDirection};
use crate::range::KeyRange;
use crate::schema::Schema;
use crate::types::Row;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Unique identifier for a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId(pub u64);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Predicate pushed to one backend: the query's key ranges clipped to the
/// partition bounds plus the non-key conditions verbatim.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FragmentPredicate {
    pub key_ranges: Vec<KeyRange>,
    pub filters: Vec<Condition>,
}

impl FragmentPredicate {
    pub fn new(key_ranges: Vec<KeyRange>, filters: Vec<Condition>) -> Self {
        Self {
            key_ranges,
            filters,
        }
    }

    /// Every row in `range`, no other filter.
    pub fn range(range: KeyRange) -> Self {
        Self::new(vec![range], Vec::new())
    }

    pub fn matches(&self, schema: &Schema, row: &Row) -> Result<bool> {
        let key = schema.key_of(row)?;
        if !self.key_ranges.iter().any(|r| r.contains(key)) {
            return Ok(false);
        }
        for filter in &self.filters {
            if !filter.evaluate(schema, row)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[derive(Debug, Clone)]
pub struct Fragment {
    pub partition_id: PartitionId,
    pub backend: Arc<BackendRef>,
    pub predicate: FragmentPredicate,
    /// Aggregation the backend computes itself, returning a partial.
    pub aggregation: Option<Aggregation>,
    /// Key order the backend must scan in.
    pub order: Option<SortDirection>,
    pub limit: Option<usize>,
}

impl Fragment {
    /// A plain key-range scan, used for data movement.
    pub fn scan(partition_id: PartitionId, backend: Arc<BackendRef>, range: KeyRange) -> Self {
        Self {
            partition_id,
            backend,
            predicate: FragmentPredicate::range(range),
            aggregation: None,
            order: None,
            limit: None,
        }
    }

    pub fn ordered(mut self, direction: SortDirection) -> Self {
        self.order = Some(direction);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

impl fmt::Display for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ranges: Vec<String> = self
            .predicate
            .key_ranges
            .iter()
            .map(|r| r.to_string())
            .collect();
        write!(
            f,
            "{}@{} ranges=[{}]",
            self.partition_id,
            self.backend.id,
            ranges.join(", ")
        )?;
        if !self.predicate.filters.is_empty() {
            write!(f, " filters={}", self.predicate.filters.len())?;
        }
        if let Some(aggregation) = &self.aggregation {
            write!(f, " agg={}", aggregation)?;
        }
        if let Some(order) = self.order {
            write!(f, " order={:?}", order)?;
        }
        if let Some(limit) = self.limit {
            write!(f, " limit={}", limit)?;
        }
        Ok(())
    }
}

/// What a backend returns for one fragment.
#[derive(Debug, Clone, PartialEq)]
pub enum FragmentResult {
    Rows(Vec<Row>),
    Partial(PartialAggregate),
}

impl FragmentResult {
    pub fn row_count(&self) -> usize {
        match self {
            FragmentResult::Rows(rows) => rows.len(),
            FragmentResult::Partial(partial) => partial.groups().len(),
        }
    }

    pub fn into_rows(self) -> Option<Vec<Row>> {
        match self {
            FragmentResult::Rows(rows) => Some(rows),
            FragmentResult::Partial(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendCapabilities, StorageKind};
    use crate::schema::Field;
    use crate::types::{DataType, Value};

    #[test]
    fn test_fragment_predicate_matches() {
        let schema = Schema::new(
            vec![
                Field::new("day", DataType::Int64, false),
                Field::new("region", DataType::Utf8, true),
            ],
            "day",
        )
        .unwrap();
        let predicate = FragmentPredicate::new(
            vec![KeyRange::bounded(10, 20), KeyRange::bounded(30, 40)],
            vec![Condition::eq("region", "eu")],
        );

        assert!(predicate
            .matches(&schema, &vec![Value::Int64(35), Value::from("eu")])
            .unwrap());
        assert!(!predicate
            .matches(&schema, &vec![Value::Int64(25), Value::from("eu")])
            .unwrap());
        assert!(!predicate
            .matches(&schema, &vec![Value::Int64(15), Value::from("us")])
            .unwrap());
    }

    #[test]
    fn test_display() {
        let backend = Arc::new(BackendRef::new(
            "archive-b",
            "mem://archive-b",
            StorageKind::Remote,
            BackendCapabilities::default(),
        ));
        let fragment = Fragment::scan(PartitionId(2), backend, KeyRange::bounded(1, 5))
            .ordered(SortDirection::Ascending)
            .with_limit(3);
        assert_eq!(
            fragment.to_string(),
            "p2@archive-b ranges=[[1, 5)] order=Ascending limit=3"
        );
    }
}
