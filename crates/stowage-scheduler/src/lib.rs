//! stowage-scheduler — destination selection and capacity reservation.
//!
//! Turns a `RequestSpec` (from `stowage-state`) into ranked destinations by
//! running the filter and weigher pipelines from `stowage-placement` over
//! the host inventory, and speaks the allocation ledger protocol used to
//! reserve capacity on the chosen destination.
//!
//! # Architecture
//!
//! ```text
//! Scheduler (DestinationQuery)
//!   ├── InventoryService (host snapshots, optionally per cell)
//!   ├── FilterPipeline   (hard admission)
//!   └── WeigherPipeline  (soft ranking) → Selection { primary, alternates }
//!
//! AllocationLedger (claim / transfer / release, compare-and-swap)
//!   └── ledger::protocol (timeouts, conflict vs fault)
//! ```
//!
//! # Components
//!
//! - **`scheduler`** — `Scheduler`, `Selection`
//! - **`query`** — `DestinationQuery` seam used by the migration orchestrator
//! - **`ledger`** — `AllocationLedger`, `InMemoryLedger`, protocol helpers
//! - **`locks`** — `NamedLocks`, per-name async critical sections
//! - **`group_sync`** — `ServerGroupSync`, server-group placement rules

pub mod error;
pub mod group_sync;
pub mod ledger;
pub mod locks;
pub mod query;
pub mod scheduler;

pub use error::{LedgerError, LedgerResult, SchedulerError, SchedulerResult};
pub use group_sync::{GroupRuleBackend, PlacementRule, ServerGroupSync, SyncOutcome};
pub use ledger::protocol::ClaimOutcome;
pub use ledger::{AllocationLedger, InMemoryLedger, LedgerFuture};
pub use locks::{NamedGuard, NamedLocks};
pub use query::{DestinationQuery, QueryFuture};
pub use scheduler::{Scheduler, Selection};
