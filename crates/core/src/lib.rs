//! `queuectl-core` — job model and queue building blocks.
//!
//! This crate contains the **pure** pieces of the queue (no storage, no
//! processes): the job record and its states, identifiers, the error model,
//! the backoff policy and the clock abstraction.

pub mod backoff;
pub mod clock;
pub mod error;
pub mod id;
pub mod job;

pub use backoff::BackoffPolicy;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{QueueError, QueueResult};
pub use id::JobId;
pub use job::{DEFAULT_MAX_RETRIES, Job, JobSpec, JobState};
