//! Job lifecycle engine.
//!
//! `JobQueue` owns every state transition. Workers and operators go through it;
//! only the store's `claim_next` and guarded `update` touch records.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use queuectl_core::{
    Clock, DEFAULT_MAX_RETRIES, Job, JobId, JobSpec, JobState, QueueError, QueueResult,
    SystemClock,
};

use super::store::{JobCounts, JobFilter, JobOrder, JobStore, JobUpdate};

/// Lifecycle engine over a [`JobStore`].
pub struct JobQueue<S: JobStore> {
    store: S,
    clock: Arc<dyn Clock>,
    default_max_retries: u32,
}

impl<S: JobStore> JobQueue<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            default_max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Retry budget for specs that do not carry their own.
    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Validate and persist a new `pending` job.
    pub async fn enqueue(&self, spec: JobSpec) -> QueueResult<Job> {
        spec.validate()?;
        let job = Job::from_spec(spec, self.default_max_retries, self.clock.now());
        self.store.insert(job.clone()).await?;

        info!(
            job_id = %job.id,
            priority = job.priority,
            max_retries = job.max_retries,
            "job enqueued"
        );
        Ok(job)
    }

    /// Claim the next eligible job at `now`.
    ///
    /// The claimed job's `run_at` is checked again against the same `now`, so a
    /// store that hands out a job early cannot start it. Such a job goes back to
    /// `pending` without spending an attempt and `None` is returned.
    pub async fn acquire(&self, now: DateTime<Utc>) -> QueueResult<Option<Job>> {
        let Some(job) = self.store.claim_next(now).await? else {
            return Ok(None);
        };

        if let Some(run_at) = job.run_at
            && run_at > now
        {
            debug!(job_id = %job.id, %run_at, "claimed job not yet due, requeueing");
            self.requeue(&job.id).await?;
            return Ok(None);
        }

        debug!(job_id = %job.id, attempts = job.attempts, "job claimed");
        Ok(Some(job))
    }

    /// `processing -> completed`, recording stdout.
    pub async fn complete(&self, id: &JobId, output: impl Into<String>) -> QueueResult<Job> {
        let job = self
            .store
            .update(
                id,
                JobUpdate::at(self.clock.now())
                    .state(JobState::Completed)
                    .output(output)
                    .when_state(JobState::Processing),
            )
            .await?;

        info!(job_id = %job.id, attempts = job.attempts, "job completed");
        Ok(job)
    }

    /// Record a failed attempt: back to `pending` while budget remains, else `dead`.
    pub async fn fail(&self, id: &JobId, error: impl Into<String>) -> QueueResult<Job> {
        let current = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;
        if current.state != JobState::Processing {
            return Err(QueueError::InvalidTransition {
                id: id.clone(),
                state: current.state,
            });
        }

        let attempts = current.attempts.saturating_add(1);
        let next = if attempts >= current.max_retries {
            JobState::Dead
        } else {
            JobState::Pending
        };
        let error = error.into();

        // Guarded on the attempts we read so a concurrent report cannot double count.
        let job = self
            .store
            .update(
                id,
                JobUpdate::at(self.clock.now())
                    .state(next)
                    .attempts(attempts)
                    .error(error.clone())
                    .when_state(JobState::Processing)
                    .when_attempts(current.attempts),
            )
            .await?;

        if job.state == JobState::Dead {
            warn!(
                job_id = %job.id,
                attempts = job.attempts,
                max_retries = job.max_retries,
                error = %error,
                "job moved to dead letter queue"
            );
        } else {
            info!(
                job_id = %job.id,
                attempts = job.attempts,
                max_retries = job.max_retries,
                error = %error,
                "job failed, will retry"
            );
        }
        Ok(job)
    }

    /// `processing -> pending` without consuming an attempt.
    pub async fn requeue(&self, id: &JobId) -> QueueResult<Job> {
        self.store
            .update(
                id,
                JobUpdate::at(self.clock.now())
                    .state(JobState::Pending)
                    .when_state(JobState::Processing),
            )
            .await
    }

    /// Operator retry: `dead -> pending` with the attempt count reset.
    ///
    /// The last error is kept for inspection. Fails with `NotFound` unless a
    /// dead job with this id exists.
    pub async fn retry_dead_letter(&self, id: &JobId) -> QueueResult<Job> {
        let result = self
            .store
            .update(
                id,
                JobUpdate::at(self.clock.now())
                    .state(JobState::Pending)
                    .attempts(0)
                    .when_state(JobState::Dead),
            )
            .await;

        match result {
            Ok(job) => {
                info!(job_id = %job.id, "dead job requeued by operator");
                Ok(job)
            }
            Err(QueueError::InvalidTransition { .. }) => Err(QueueError::NotFound(id.clone())),
            Err(e) => Err(e),
        }
    }

    pub async fn get(&self, id: &JobId) -> QueueResult<Option<Job>> {
        self.store.get(id).await
    }

    pub async fn list(&self, filter: &JobFilter) -> QueueResult<Vec<Job>> {
        self.store.list(filter).await
    }

    pub async fn counts(&self) -> QueueResult<JobCounts> {
        self.store.counts().await
    }

    /// Dead jobs, oldest transition first.
    pub async fn list_dead_letters(&self) -> QueueResult<Vec<Job>> {
        self.store
            .list(&JobFilter::state(JobState::Dead).order_by(JobOrder::UpdatedAt))
            .await
    }

    /// Remove every job.
    pub async fn purge(&self) -> QueueResult<u64> {
        let removed = self.store.delete_all().await?;
        warn!(removed, "job queue purged");
        Ok(removed)
    }
}
