//! Claim and transfer helpers shared by every ledger caller.
//!
//! These wrap the raw ledger calls with a timeout and consistent logging.
//! A conflict is `Ok(false)`; only collaborator faults are `Err`.

use std::time::Duration;

use stowage_state::{AllocationCandidate, Resources};
use tracing::{debug, info, warn};

use super::AllocationLedger;
use crate::error::{LedgerError, LedgerResult};

/// Outcome of claiming a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The ledger accepted the reservation.
    Claimed,
    /// The candidate carries no allocation request; nothing was reserved.
    NotRequired,
    /// Stale version or insufficient capacity.
    Conflict,
}

async fn with_timeout<T>(
    timeout: Duration,
    call: impl std::future::Future<Output = LedgerResult<T>>,
) -> LedgerResult<T> {
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| LedgerError::Timeout(timeout))?
}

/// Atomically move `allocation` on `provider` from one consumer to another.
pub async fn transfer(
    ledger: &dyn AllocationLedger,
    provider: &str,
    from: &str,
    to: &str,
    allocation: &Resources,
    timeout: Duration,
) -> LedgerResult<bool> {
    let moved = with_timeout(timeout, ledger.transfer_allocation(provider, from, to, allocation)).await?;
    if moved {
        info!(%provider, %from, %to, memory_mb = allocation.memory_mb, "allocation transferred");
    } else {
        warn!(%provider, %from, %to, "allocation transfer lost a concurrent update");
    }
    Ok(moved)
}

/// Reserve a candidate's allocation request for `consumer`.
pub async fn claim(
    ledger: &dyn AllocationLedger,
    consumer: &str,
    candidate: &AllocationCandidate,
    timeout: Duration,
) -> LedgerResult<ClaimOutcome> {
    let Some(request) = candidate.allocation_request.as_deref() else {
        debug!(host = %candidate.host, "candidate has no allocation request, nothing to claim");
        return Ok(ClaimOutcome::NotRequired);
    };
    let claimed = with_timeout(timeout, ledger.claim(consumer, request, candidate.version)).await?;
    if claimed {
        debug!(host = %candidate.host, %consumer, "allocation claimed");
        Ok(ClaimOutcome::Claimed)
    } else {
        info!(host = %candidate.host, %consumer, version = candidate.version, "allocation claim rejected");
        Ok(ClaimOutcome::Conflict)
    }
}

/// Release whatever `consumer` holds on `provider`.
pub async fn release_all(
    ledger: &dyn AllocationLedger,
    consumer: &str,
    provider: &str,
    timeout: Duration,
) -> LedgerResult<()> {
    let Some(held) = with_timeout(timeout, ledger.get_allocations_for_consumer(provider, consumer)).await? else {
        return Ok(());
    };
    with_timeout(timeout, ledger.release_provider_allocation(consumer, provider, &held)).await?;
    debug!(%provider, %consumer, memory_mb = held.memory_mb, "allocation released");
    Ok(())
}
