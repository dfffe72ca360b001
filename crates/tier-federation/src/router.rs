//! Query router
//!
//! Prunes the catalog snapshot to the partitions a query can touch and builds
//! one fragment per partition, deciding per backend what can be pushed down.

use crate::catalog::{CatalogSnapshot, PartitionDescriptor};
use crate::merge::{MergePlan, SortKey};
use std::sync::Arc;
use tier_core::{
    BoundAggregation, Fragment, FragmentPredicate, QuerySpec, Result, Schema, SortDirection,
    TierError,
};
use tracing::debug;

/// How the executor should drive a routed query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Dispatch every fragment concurrently
    Parallel,
    /// Visit fragments in key order and stop once `limit` rows are in hand
    OrderedLimit { limit: usize },
}

/// Output of routing: the fragments to run and how to combine them
#[derive(Debug, Clone)]
pub struct RoutedQuery {
    /// Fragments in the order their results are merged; key order (or
    /// reverse key order for descending queries)
    pub fragments: Vec<Fragment>,
    pub mode: ExecutionMode,
    pub merge: MergePlan,
}

impl RoutedQuery {
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }
}

/// Builds fragments for queries against one relation
#[derive(Debug, Clone)]
pub struct QueryRouter {
    schema: Schema,
}

impl QueryRouter {
    pub fn new(schema: Schema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Route `spec` against `snapshot`.
    ///
    /// Exactly the partitions whose range intersects the predicate's key
    /// ranges get a fragment; each fragment's key ranges are clipped to the
    /// partition bounds. No matching partition is not an error.
    pub fn route(&self, spec: &QuerySpec, snapshot: &CatalogSnapshot) -> Result<RoutedQuery> {
        spec.validate(&self.schema)?;

        let key_column = self.schema.key_column();
        let key_ranges = spec.predicate().key_ranges(key_column)?;
        let filters = spec.predicate().residual(key_column);
        let key_order = spec.key_order(&self.schema);
        let aggregation = spec.aggregation();

        // Ranges are sorted and disjoint, so one partition's matches are adjacent
        let mut partitions: Vec<&PartitionDescriptor> = Vec::new();
        for range in &key_ranges {
            for partition in snapshot.lookup(range) {
                if partitions.last().map(|p| p.id) != Some(partition.id) {
                    partitions.push(partition);
                }
            }
        }

        let mut fragments = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let backend = snapshot
                .backend(&partition.backend)
                .ok_or_else(|| TierError::BackendNotFound(partition.backend.to_string()))?;
            let capabilities = backend.capabilities;

            let clipped = key_ranges
                .iter()
                .filter_map(|r| r.intersect(&partition.range))
                .collect();

            let pushed_aggregation = aggregation
                .filter(|a| {
                    capabilities.supports_pushdown_aggregation && a.function.is_decomposable()
                })
                .cloned();
            let pushed_order = key_order.filter(|_| {
                aggregation.is_none() && capabilities.supports_ordered_scan
            });
            let pushed_limit = spec.row_limit().filter(|_| {
                aggregation.is_none() && (spec.ordering().is_none() || pushed_order.is_some())
            });

            fragments.push(Fragment {
                partition_id: partition.id,
                backend: Arc::clone(&backend),
                predicate: FragmentPredicate::new(clipped, filters.clone()),
                aggregation: pushed_aggregation,
                order: pushed_order,
                limit: pushed_limit,
            });
        }

        if key_order == Some(SortDirection::Descending) {
            fragments.reverse();
        }

        let mode = match (key_order, spec.row_limit(), aggregation) {
            (Some(_), Some(limit), None) => ExecutionMode::OrderedLimit { limit },
            _ => ExecutionMode::Parallel,
        };

        let merge = MergePlan {
            aggregation: aggregation
                .map(|a| BoundAggregation::bind(a, &self.schema))
                .transpose()?,
            order: spec
                .ordering()
                .map(|o| -> Result<SortKey> {
                    Ok(SortKey {
                        column: self.schema.index_of(&o.column)?,
                        direction: o.direction,
                    })
                })
                .transpose()?,
            limit: spec.row_limit(),
        };

        debug!(
            "Routed query [{}] to {} fragments ({:?})",
            spec.predicate(),
            fragments.len(),
            mode
        );
        for fragment in &fragments {
            debug!("  fragment {}", fragment);
        }

        Ok(RoutedQuery {
            fragments,
            mode,
            merge,
        })
    }
}
