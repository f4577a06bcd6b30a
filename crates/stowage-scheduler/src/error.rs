//! Scheduler and ledger error types.

use std::time::Duration;

use stowage_placement::FilterError;
use thiserror::Error;

/// Errors that can occur while selecting destinations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no valid host found: {0}")]
    NoValidHost(String),

    #[error("filter pipeline error: {0}")]
    Filter(#[from] FilterError),

    #[error("state store error: {0}")]
    State(#[from] stowage_state::StateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("placement rule backend error: {0}")]
    RuleBackend(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Faults reported by the allocation ledger. Concurrency conflicts are not
/// faults; they surface as `Ok(false)`.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    #[error("invalid allocation request: {0}")]
    InvalidRequest(String),

    #[error("ledger call timed out after {0:?}")]
    Timeout(Duration),
}

pub type LedgerResult<T> = Result<T, LedgerError>;
