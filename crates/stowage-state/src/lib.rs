//! stowage-state — domain types and embedded state for Stowage.
//!
//! Host snapshots, request descriptors and allocation candidates are plain
//! serde types passed between the placement pipelines, the scheduler and
//! the migration orchestrator. Migration records, workloads and instance
//! groups are persisted through [`StateStore`], backed by
//! [redb](https://docs.rs/redb).
//!
//! # Components
//!
//! - **`types`** — RequestSpec, HostState, InstanceGroup, AllocationCandidate, Migration
//! - **`store`** — `StateStore` plus the `MigrationStore` / `WorkloadStore` seams
//! - **`tables`** — redb table definitions

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{GroupStore, MigrationStore, StateStore, WorkloadStore};
pub use types::*;
