//! Allocation ledger — the external record of capacity reservations.
//!
//! The ledger is the only source of truth for capacity. Every write is a
//! single compare-and-swap on the ledger side; a lost race is reported as
//! `Ok(false)` and never leaves a partial write behind.

pub mod memory;
pub mod protocol;

use std::future::Future;
use std::pin::Pin;

use stowage_state::Resources;

use crate::error::LedgerResult;

pub use memory::InMemoryLedger;

/// Boxed future alias for ledger calls.
pub type LedgerFuture<'a, T> = Pin<Box<dyn Future<Output = LedgerResult<T>> + Send + 'a>>;

/// Client for the allocation ledger — injected for testability.
pub trait AllocationLedger: Send + Sync {
    /// Reservation `consumer` holds on `provider`, if any.
    fn get_allocations_for_consumer<'a>(
        &'a self,
        provider: &'a str,
        consumer: &'a str,
    ) -> LedgerFuture<'a, Option<Resources>>;

    /// Atomically write `allocation` for `to` on `provider` and clear the
    /// reservation `from` holds there.
    fn transfer_allocation<'a>(
        &'a self,
        provider: &'a str,
        from: &'a str,
        to: &'a str,
        allocation: &'a Resources,
    ) -> LedgerFuture<'a, bool>;

    /// First-time reservation from a serialized allocation request. Fails
    /// with `Ok(false)` when `version` is stale or capacity is short.
    fn claim<'a>(
        &'a self,
        consumer: &'a str,
        allocation_request: &'a str,
        version: u64,
    ) -> LedgerFuture<'a, bool>;

    /// Give back part or all of a reservation. Missing reservations are ignored.
    fn release_provider_allocation<'a>(
        &'a self,
        consumer: &'a str,
        provider: &'a str,
        resources: &'a Resources,
    ) -> LedgerFuture<'a, ()>;
}
