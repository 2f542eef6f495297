//! Job record, lifecycle states and the producer-facing spec.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::id::JobId;

/// Retry budget applied when the producer does not pick one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Lifecycle state of a job.
///
/// ```text
/// pending    -> processing            (claim)
/// processing -> completed             (success, terminal)
/// processing -> pending               (failure with budget left, or not yet eligible)
/// processing -> dead                  (failure with budget exhausted, terminal)
/// dead       -> pending               (operator retry, attempts reset)
/// ```
///
/// `Failed` is part of the persisted vocabulary and is counted, but the engine
/// sends retryable failures straight back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }

    /// No engine transition leaves a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Dead)
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            other => Err(QueueError::corrupt(format!("unknown job state '{other}'"))),
        }
    }
}

/// What a producer submits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Caller-chosen id; generated when absent.
    pub id: Option<JobId>,
    pub command: String,
    pub timeout: Option<Duration>,
    pub run_at: Option<DateTime<Utc>>,
    pub priority: i32,
    /// Retry budget; the queue's configured default when absent.
    pub max_retries: Option<u32>,
}

impl JobSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            id: None,
            command: command.into(),
            timeout: None,
            run_at: None,
            priority: 0,
            max_retries: None,
        }
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Reject specs the queue cannot run.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.command.trim().is_empty() {
            return Err(QueueError::invalid_spec("command must not be empty"));
        }
        if let Some(id) = &self.id
            && id.as_str().trim().is_empty()
        {
            return Err(QueueError::invalid_spec("job id must not be empty"));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(QueueError::invalid_spec("timeout must be greater than zero"));
        }
        Ok(())
    }
}

/// A job as persisted by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub command: String,
    pub state: JobState,
    /// Completed execution attempts.
    pub attempts: u32,
    pub max_retries: u32,
    pub timeout: Option<Duration>,
    pub run_at: Option<DateTime<Utc>>,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Stdout of the last successful attempt.
    pub output: Option<String>,
    /// Failure reason of the last failed attempt.
    pub error: Option<String>,
}

impl Job {
    /// Build a fresh `pending` record from a validated spec.
    pub fn from_spec(spec: JobSpec, default_max_retries: u32, now: DateTime<Utc>) -> Self {
        let now = now.trunc_subsecs(6);
        Self {
            id: spec.id.unwrap_or_default(),
            command: spec.command,
            state: JobState::Pending,
            attempts: 0,
            max_retries: spec.max_retries.unwrap_or(default_max_retries),
            timeout: spec.timeout.map(ceil_micros),
            run_at: spec.run_at.map(|at| at.trunc_subsecs(6)),
            priority: spec.priority,
            created_at: now,
            updated_at: now,
            output: None,
            error: None,
        }
    }

    /// A pending job whose `run_at` (if any) has passed.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Pending && self.run_at.is_none_or(|at| at <= now)
    }

    /// Budget left after the attempts recorded so far.
    pub fn retries_left(&self) -> u32 {
        self.max_retries.saturating_sub(self.attempts)
    }
}

/// Round up to whole microseconds, the precision records are stored with.
fn ceil_micros(d: Duration) -> Duration {
    let micros = d.as_micros() + u128::from(d.subsec_nanos() % 1_000 != 0);
    u64::try_from(micros).map_or(Duration::MAX, Duration::from_micros)
}
