//! Queue configuration loading and representation.

use std::str::FromStr;
use std::time::Duration;

use queuectl_core::{BackoffPolicy, DEFAULT_MAX_RETRIES};

use crate::workers::JobWorkerConfig;

pub const DATABASE_URL_VAR: &str = "QUEUECTL_DATABASE_URL";
pub const MAX_RETRIES_VAR: &str = "QUEUECTL_MAX_RETRIES";
pub const BACKOFF_BASE_MS_VAR: &str = "QUEUECTL_BACKOFF_BASE_MS";
pub const BACKOFF_FACTOR_VAR: &str = "QUEUECTL_BACKOFF_FACTOR";
pub const BACKOFF_MAX_MS_VAR: &str = "QUEUECTL_BACKOFF_MAX_MS";
pub const POLL_INTERVAL_MS_VAR: &str = "QUEUECTL_POLL_INTERVAL_MS";
pub const WORKERS_VAR: &str = "QUEUECTL_WORKERS";

/// Queue and worker settings.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// sqlx SQLite URL, e.g. `sqlite://queue.db`.
    pub database_url: String,
    /// Retry budget for jobs enqueued without one.
    pub default_max_retries: u32,
    pub backoff: BackoffPolicy,
    /// Poll interval when the queue is empty.
    pub idle_interval: Duration,
    pub store_retry_interval: Duration,
    pub report_attempts: u32,
    pub worker_count: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://queue.db".to_string(),
            default_max_retries: DEFAULT_MAX_RETRIES,
            backoff: BackoffPolicy::default(),
            idle_interval: Duration::from_secs(1),
            store_retry_interval: Duration::from_secs(1),
            report_attempts: 3,
            worker_count: 1,
        }
    }
}

impl QueueConfig {
    /// Load from `QUEUECTL_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` in place of the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let database_url = lookup(DATABASE_URL_VAR).unwrap_or_else(|| {
            tracing::warn!(
                database_url = %defaults.database_url,
                "{DATABASE_URL_VAR} not set; using default"
            );
            defaults.database_url.clone()
        });

        let base_ms = parse_or(&lookup, BACKOFF_BASE_MS_VAR, millis(defaults.backoff.base_delay));
        let factor = parse_or(&lookup, BACKOFF_FACTOR_VAR, defaults.backoff.factor);
        let max_ms = parse_or(&lookup, BACKOFF_MAX_MS_VAR, millis(defaults.backoff.max_delay));
        let poll_ms = parse_or(&lookup, POLL_INTERVAL_MS_VAR, millis(defaults.idle_interval));

        Self {
            database_url,
            default_max_retries: parse_or(&lookup, MAX_RETRIES_VAR, defaults.default_max_retries),
            backoff: BackoffPolicy::new(
                Duration::from_millis(base_ms),
                factor,
                Duration::from_millis(max_ms),
            ),
            idle_interval: Duration::from_millis(poll_ms),
            worker_count: parse_or(&lookup, WORKERS_VAR, defaults.worker_count).max(1),
            ..defaults
        }
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    /// The per-worker slice of this configuration.
    pub fn worker_config(&self) -> JobWorkerConfig {
        JobWorkerConfig::default()
            .with_idle_interval(self.idle_interval)
            .with_store_retry_interval(self.store_retry_interval)
            .with_report_attempts(self.report_attempts)
            .with_backoff(self.backoff)
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!(value = %raw, %default, "{key} is not valid; using default");
            default
        }
    }
}
