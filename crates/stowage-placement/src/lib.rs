//! Stowage host selection pipelines.
//!
//! This crate narrows and ranks candidate hosts for a request. It does NOT
//! claim capacity or talk to the allocation ledger (that's
//! `stowage-scheduler`). Stages are pure over the host snapshots they are
//! handed, apart from the cached lookups they are constructed with.
//!
//! # Components
//!
//! - **`filters`** — Admission stages and the filter pipeline
//! - **`weighers`** — Scoring stages and the normalized weigher pipeline
//! - **`registry`** — Builds both pipelines from configured stage names
//! - **`cache`** — TTL cache with per-entry or wholesale expiry
//! - **`tags`** — Cached tenant tag lookup
//! - **`inventory`** — Host inventory collaborator and ceiling cache

pub mod cache;
pub mod clock;
pub mod error;
pub mod filters;
pub mod inventory;
pub mod registry;
pub mod tags;
pub mod weighers;

pub use cache::{CacheStats, Expiry, TtlCache, TtlCacheConfig};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{FilterError, FilterResult};
pub use filters::{BatchFilter, FilterPipeline, FilterRun, FilterStage, HostFilter, MetadataReporter, Verdict};
pub use inventory::{CeilingCache, ClusterSelector, HostQuery, InventoryService, StaticInventory};
pub use registry::{StageContext, StageRegistry};
pub use tags::{StaticTags, TagCache, TagLookup, TenantTagService};
pub use weighers::{HostWeigher, WeighedHost, WeigherPipeline, normalize};
