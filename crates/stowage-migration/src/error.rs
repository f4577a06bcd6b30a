//! Migration error types.
//!
//! One variant per terminal classification the caller can see. Rejected
//! alternates never show up here; they are only logged.

use stowage_placement::FilterError;
use stowage_scheduler::{LedgerError, SchedulerError};
use stowage_state::StateError;
use thiserror::Error;

/// Terminal classification of a failed relocation.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("no valid host: {0}")]
    NoValidHost(String),

    #[error("max retries exceeded: {0}")]
    MaxRetriesExceeded(String),

    #[error("scheduler unavailable: {0}")]
    SchedulerUnavailable(String),

    #[error("remote service error: {0}")]
    Remote(String),

    #[error("source allocation changed concurrently: {0}")]
    AllocationConflict(String),

    #[error("workload not found: {0}")]
    WorkloadNotFound(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("configuration error: {0}")]
    Configuration(String),
}

pub type MigrationResult<T> = Result<T, MigrationError>;

impl From<LedgerError> for MigrationError {
    fn from(e: LedgerError) -> Self {
        MigrationError::Remote(e.to_string())
    }
}

impl From<SchedulerError> for MigrationError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::NoValidHost(reason) => MigrationError::NoValidHost(reason),
            SchedulerError::Filter(FilterError::Configuration(reason)) => {
                MigrationError::Configuration(reason)
            }
            other => MigrationError::SchedulerUnavailable(other.to_string()),
        }
    }
}

impl MigrationError {
    /// Whether the record should end as `failed` rather than `error`.
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, MigrationError::MaxRetriesExceeded(_))
    }
}
