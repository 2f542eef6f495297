//! Worker pacing after failed attempts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff: `min(base_delay * factor^attempt, max_delay)`.
///
/// Used only to pace the failing worker's next poll. Nothing here is persisted
/// and it has no effect on when other workers may claim the job.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, factor: f64, max_delay: Duration) -> Self {
        Self {
            base_delay,
            factor,
            max_delay,
        }
    }

    /// Same delay after every failure.
    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, 1.0, delay)
    }

    /// Delay after the `attempt`-th failure (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.factor.powi(exp);

        if secs.is_nan() || secs <= 0.0 {
            return Duration::ZERO;
        }
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs).min(self.max_delay)
    }
}
