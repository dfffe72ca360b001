//! Storage tiers for the federation layer.
//!
//! - [`memory`]: Arrow-backed in-memory tier with fault injection

pub mod memory;

pub use memory::{MemoryBackend, MemorySession};
