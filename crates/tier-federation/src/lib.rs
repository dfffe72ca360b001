//! Query federation across storage tiers
//!
//! One logical relation is range-partitioned on its key column and each
//! partition lives on exactly one backend (local disk, a remote archive,
//! object storage). This crate keeps the partition catalog, turns queries
//! into per-partition fragments, executes them concurrently through pooled
//! sessions and merges the answers. Partitions move between backends while
//! queries and writes keep running.
//!
//! # Architecture
//!
//! - **Catalog**: versioned, immutable routing snapshots swapped atomically
//! - **Router**: prunes partitions, pushes work down, plans the merge
//! - **Executor**: concurrent fan-out with deadlines, retries and early stop
//! - **Merger**: concatenation, k-way sorted merge, partial aggregates
//! - **Migration**: copy, verify, cut over and decommission a partition
//! - **Relation**: the facade tying these together
//!
//! # Example
//!
//! ```ignore
//! use tier_federation::{Catalog, CatalogSnapshot, FederatedRelation, FederationConfig};
//! use tier_core::{Condition, QuerySpec};
//!
//! let relation = FederatedRelation::new("events", schema, Catalog::new(snapshot), FederationConfig::default());
//! relation.register_backend(Arc::new(archive))?;
//! relation.register_backend(Arc::new(primary))?;
//!
//! let result = relation
//!     .query(&QuerySpec::scan().filter(Condition::between("day", 20240101, 20240131)))
//!     .await?;
//!
//! relation.start_migration(PartitionId(3), BackendId::new("archive-c")).await?;
//! ```
//!
//! # Modules
//!
//! - [`catalog`]: partition catalog and snapshots
//! - [`persistence`]: durable catalog stores
//! - [`router`]: query routing and pushdown
//! - [`executor`]: fan-out execution
//! - [`merge`]: result merging
//! - [`pool`]: per-backend session pools
//! - [`migration`]: live partition migration
//! - [`gate`]: write gates and snapshot leases
//! - [`fault`]: retry policy and backend failure tracking

pub mod catalog;
pub mod config;
pub mod executor;
pub mod fault;
pub mod gate;
pub mod merge;
pub mod migration;
pub mod persistence;
pub mod pool;
pub mod relation;
pub mod result;
pub mod router;
pub mod stats;
pub mod types;

pub use catalog::{Catalog, CatalogSnapshot, PartitionDescriptor, PartitionState, Transition};
pub use config::{ExecutorConfig, FederationConfig, MigrationConfig, PoolConfig, RetryConfig};
pub use executor::{Execution, FanOutExecutor};
pub use fault::{BackendHealth, FaultTracker, RetryPolicy};
pub use gate::{SnapshotLease, SnapshotTracker, WriteGates};
pub use merge::{merge_sorted, FragmentOutput, MergePlan, MergedOutput, ResultMerger, SortKey};
pub use migration::{MigrationJob, MigrationOrchestrator, MigrationPhase};
pub use persistence::{CatalogStore, JsonCatalogStore, MemoryCatalogStore, PersistedCatalog};
pub use pool::{ConnectionPool, PoolRegistry, PooledSession};
pub use relation::FederatedRelation;
pub use result::{Completeness, ExecutionStats, QueryResult};
pub use router::{ExecutionMode, QueryRouter, RoutedQuery};
pub use stats::{FederationStats, PoolSnapshot, StatsSnapshot};
pub use types::{FailurePolicy, MigrationId, QueryId, QueryOptions};
