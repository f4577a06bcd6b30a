//! Compute dispatch seam.
//!
//! `check_destination` is a call: the orchestrator waits for the answer
//! (bounded by the pre-check timeout). `dispatch` is a cast: acceptance
//! only means the destination took the job, not that the relocation
//! finished.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use stowage_state::{AllocationCandidate, Flavor, HostId, Migration, Workload};

use crate::error::MigrationResult;

/// Boxed future alias for compute calls.
pub type DispatchFuture<'a> = Pin<Box<dyn Future<Output = MigrationResult<()>> + Send + 'a>>;

/// Everything the destination needs to start a relocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub host: HostId,
    pub nodename: String,
    pub workload: Workload,
    pub migration: Migration,
    pub flavor: Flavor,
    /// Fallbacks for a compute-side reschedule.
    pub alternates: Vec<AllocationCandidate>,
}

/// Client for the compute service — injected for testability.
pub trait ComputeDispatch: Send + Sync {
    /// Ask `host` whether it can take `workload`.
    fn check_destination<'a>(&'a self, host: &'a str, workload: &'a Workload) -> DispatchFuture<'a>;

    /// Hand the relocation over to the destination.
    fn dispatch<'a>(&'a self, request: &'a DispatchRequest) -> DispatchFuture<'a>;
}
