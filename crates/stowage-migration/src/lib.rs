//! stowage-migration — cold migration and resize orchestration.
//!
//! Relocates a workload to a new host without ever leaving its capacity
//! unprotected: the source reservation moves onto the migration record,
//! a destination is claimed for the workload, and only then is the job
//! handed to compute. Every failure before dispatch is rolled back.
//!
//! # Components
//!
//! - **`orchestrator`** — `MigrationOrchestrator` state machine (pre-allocate, select, claim, dispatch, rollback)
//! - **`selector`** — `DestinationSelector`, claim-and-verify over ranked candidates
//! - **`dispatch`** — `ComputeDispatch` seam to the compute service

pub mod dispatch;
pub mod error;
pub mod orchestrator;
pub mod selector;

pub use dispatch::{ComputeDispatch, DispatchFuture, DispatchRequest};
pub use error::{MigrationError, MigrationResult};
pub use orchestrator::{HeldAllocation, MigrationOrchestrator, MigrationPhase, MigrationRequest, MigrationTask};
pub use selector::{ClaimedDestination, DestinationSelector, Selected};
