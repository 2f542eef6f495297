//! Queue error model.

use thiserror::Error;

use crate::id::JobId;
use crate::job::JobState;

/// Result type used across the queue crates.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors surfaced by the store and the lifecycle engine.
///
/// Job-level execution failures are *not* represented here: they are recorded on
/// the job record (`error` column) and drive the retry/dead-letter policy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The producer supplied an unusable job spec.
    #[error("invalid job spec: {0}")]
    InvalidSpec(String),

    /// A job with this id already exists.
    #[error("job already exists: {0}")]
    DuplicateId(JobId),

    /// No job with this id (or no job in the required state, for operator calls).
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// A transition was requested from a state that does not allow it.
    #[error("job {id} is {state}, transition not allowed")]
    InvalidTransition { id: JobId, state: JobState },

    /// The durable store could not be reached or rejected the operation.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// A persisted record could not be decoded.
    #[error("corrupt job record: {0}")]
    Corrupt(String),
}

impl QueueError {
    pub fn invalid_spec(msg: impl Into<String>) -> Self {
        Self::InvalidSpec(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// Infrastructure faults: the caller should pause and retry rather than
    /// treat the job as failed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}
