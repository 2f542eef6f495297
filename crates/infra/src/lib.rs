//! Infrastructure layer: job storage, the lifecycle engine, command execution
//! and the worker pool.

pub mod config;
pub mod jobs;
pub mod workers;

pub use config::QueueConfig;

mod integration_tests;
