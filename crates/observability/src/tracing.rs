//! Tracing/logging initialization.
//!
//! JSON lines on stdout, one object per event. Worker and job context travels
//! as structured fields (`worker`, `job_id`, `attempts`, `error`), so
//! `RUST_LOG=queuectl_infra=debug` is usually all that is needed to follow a job.

use tracing_subscriber::EnvFilter;

/// Initialize tracing/logging for the process.
///
/// `RUST_LOG` wins when set; otherwise `default_filter` is used.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}
