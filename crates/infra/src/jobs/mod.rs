//! Persistent job queue with retry, backoff, and dead-letter handling.
//!
//! ## Design
//!
//! - Jobs carry an opaque shell command and are tracked through a durable state machine
//! - Claims are atomic in the store, so any number of workers can share one database
//! - Failures retry until `max_retries` is spent, then land in the dead-letter state
//! - Dead jobs stay inspectable until an operator retries or purges them
//!
//! ## Components
//!
//! - `JobStore`: persistence port (`SqliteJobStore`, `InMemoryJobStore`)
//! - `JobQueue`: lifecycle engine, the only place transitions are decided
//! - `CommandExecutor`: runs a job's command (`ShellExecutor`)

pub mod executor;
pub mod queue;
pub mod sqlite;
pub mod store;

pub use executor::{CommandExecutor, ExecError, ExecOutput, ShellExecutor};
pub use queue::JobQueue;
pub use sqlite::SqliteJobStore;
pub use store::{InMemoryJobStore, JobCounts, JobFilter, JobOrder, JobStore, JobUpdate};
