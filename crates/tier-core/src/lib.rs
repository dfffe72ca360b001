//! Core data model for tiered query federation
//!
//! Shared by every tier crate: scalar values and rows, the relation schema,
//! half-open key ranges, predicates and queries, per-partition fragments,
//! partial aggregates, the Backend Adapter traits and the error taxonomy.

pub mod aggregate;
pub mod backend;
pub mod batch;
pub mod error;
pub mod fragment;
pub mod predicate;
pub mod query;
pub mod range;
pub mod schema;
pub mod types;

pub use aggregate::{AggregateState, BoundAggregation, NumericSum, PartialAggregate};
pub use backend::{
    BackendAdapter, BackendCapabilities, BackendId, BackendRef, BackendSession, RangeChecksum,
    StorageKind,
};
pub use batch::{record_batch_to_rows, rows_to_record_batch};
pub use error::{Result, TierError};
pub use fragment::{Fragment, FragmentPredicate, FragmentResult, PartitionId};
pub use predicate::{CompareOp, Condition, Predicate};
pub use query::{AggregateFunction, Aggregation, OrderBy, QuerySpec, SortDirection};
pub use range::KeyRange;
pub use schema::{Field, Schema};
pub use types::*;
