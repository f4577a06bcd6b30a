//! Destination query seam between the orchestrator and the scheduler.

use std::future::Future;
use std::pin::Pin;

use stowage_state::{AllocationCandidate, RequestSpec, WorkloadId};

use crate::error::SchedulerResult;

/// Boxed future alias for destination queries.
pub type QueryFuture<'a> =
    Pin<Box<dyn Future<Output = SchedulerResult<Vec<Vec<AllocationCandidate>>>> + Send + 'a>>;

/// Source of ranked destinations — injected for testability.
pub trait DestinationQuery: Send + Sync {
    /// One candidate list per workload: primary first, then alternates in
    /// descending preference when `return_alternates` is set.
    fn select_destinations<'a>(
        &'a self,
        spec: &'a RequestSpec,
        workload_ids: &'a [WorkloadId],
        return_alternates: bool,
    ) -> QueryFuture<'a>;
}
