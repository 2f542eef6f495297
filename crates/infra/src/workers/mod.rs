//! Background workers that drain the job queue.

pub mod job_worker;
pub mod pool;

pub use job_worker::{JobWorker, JobWorkerConfig, StatsCounters, Tick, WorkerStats};
pub use pool::WorkerPool;
