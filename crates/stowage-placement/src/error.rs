//! Placement pipeline error types.
//!
//! Expected per-host rejections are [`crate::Verdict::Rejected`] values,
//! never errors. An `Err` aborts the whole scheduling attempt.

use thiserror::Error;

/// Result type alias for pipeline operations.
pub type FilterResult<T> = Result<T, FilterError>;

/// Faults that abort a scheduling attempt.
#[derive(Debug, Error)]
pub enum FilterError {
    /// A stage's configuration cannot be interpreted for any host.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A collaborator failed or timed out.
    #[error("remote service error: {0}")]
    Remote(String),
}
