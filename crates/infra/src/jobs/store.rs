//! Job storage: the store port, update patches and the in-memory store.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use queuectl_core::{Job, JobId, JobState, QueueError, QueueResult};

/// Durable job storage.
///
/// `claim_next` is the single point of mutual exclusion in the system: picking
/// the next eligible job and moving it to `processing` must be one indivisible
/// step, so two callers can never receive the same job.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new record as given. Fails with `DuplicateId` on collision.
    async fn insert(&self, job: Job) -> QueueResult<()>;

    /// Claim the highest-priority eligible pending job (FIFO within a priority).
    /// Returns `None` when nothing is eligible at `now`.
    async fn claim_next(&self, now: DateTime<Utc>) -> QueueResult<Option<Job>>;

    /// Atomically apply `update` and return the new record.
    async fn update(&self, id: &JobId, update: JobUpdate) -> QueueResult<Job>;

    async fn get(&self, id: &JobId) -> QueueResult<Option<Job>>;

    async fn list(&self, filter: &JobFilter) -> QueueResult<Vec<Job>>;

    async fn counts(&self) -> QueueResult<JobCounts>;

    /// Remove every record. Returns how many were removed.
    async fn delete_all(&self) -> QueueResult<u64>;
}

/// Field overwrites plus optional guards, applied as one conditional update.
///
/// Fields left as `None` keep their stored value. When a guard does not match
/// the stored record, nothing changes and the store answers
/// `InvalidTransition` with the actual state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobUpdate {
    pub state: Option<JobState>,
    pub attempts: Option<u32>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub expect_state: Option<JobState>,
    pub expect_attempts: Option<u32>,
    pub updated_at: DateTime<Utc>,
}

impl JobUpdate {
    pub fn at(updated_at: DateTime<Utc>) -> Self {
        Self {
            state: None,
            attempts: None,
            output: None,
            error: None,
            expect_state: None,
            expect_attempts: None,
            updated_at,
        }
    }

    pub fn state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Only apply while the record is in `state`.
    pub fn when_state(mut self, state: JobState) -> Self {
        self.expect_state = Some(state);
        self
    }

    /// Only apply while the record has exactly `attempts` recorded.
    pub fn when_attempts(mut self, attempts: u32) -> Self {
        self.expect_attempts = Some(attempts);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.expect_state.is_none_or(|s| s == job.state)
            && self.expect_attempts.is_none_or(|a| a == job.attempts)
    }

    /// Check the guards, then overwrite the named fields in place.
    pub fn apply_to(&self, job: &mut Job) -> QueueResult<()> {
        if !self.matches(job) {
            return Err(QueueError::InvalidTransition {
                id: job.id.clone(),
                state: job.state,
            });
        }
        if let Some(state) = self.state {
            job.state = state;
        }
        if let Some(attempts) = self.attempts {
            job.attempts = attempts;
        }
        if let Some(output) = &self.output {
            job.output = Some(output.clone());
        }
        if let Some(error) = &self.error {
            job.error = Some(error.clone());
        }
        job.updated_at = self.updated_at;
        Ok(())
    }
}

/// Listing order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JobOrder {
    /// Priority descending, then `created_at` ascending: the order claims happen in.
    #[default]
    Claim,
    /// `updated_at` ascending (oldest transition first).
    UpdatedAt,
}

/// Listing filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub order: JobOrder,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn state(state: JobState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    pub fn order_by(mut self, order: JobOrder) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Number of jobs in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead: usize,
}

impl JobCounts {
    pub fn get(&self, state: JobState) -> usize {
        match state {
            JobState::Pending => self.pending,
            JobState::Processing => self.processing,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
            JobState::Dead => self.dead,
        }
    }

    pub fn add(&mut self, state: JobState, n: usize) {
        match state {
            JobState::Pending => self.pending += n,
            JobState::Processing => self.processing += n,
            JobState::Completed => self.completed += n,
            JobState::Failed => self.failed += n,
            JobState::Dead => self.dead += n,
        }
    }

    pub fn total(&self) -> usize {
        JobState::ALL.iter().map(|s| self.get(*s)).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (JobState, usize)> + '_ {
        JobState::ALL.into_iter().map(|s| (s, self.get(s)))
    }
}

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    job: Job,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Entry>,
    next_seq: u64,
}

/// In-memory job store for tests/dev and single-process embedding.
///
/// A single write lock covers selection and transition in `claim_next`.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn poisoned() -> QueueError {
        QueueError::unavailable("in-memory job store lock poisoned")
    }
}

fn sort_jobs(entries: &mut [&Entry], order: JobOrder) {
    match order {
        JobOrder::Claim => entries
            .sort_by_key(|e| (Reverse(e.job.priority), e.job.created_at, e.seq)),
        JobOrder::UpdatedAt => entries.sort_by_key(|e| (e.job.updated_at, e.seq)),
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> QueueResult<()> {
        let mut inner = self.inner.write().map_err(|_| Self::poisoned())?;
        if inner.jobs.contains_key(&job.id) {
            return Err(QueueError::DuplicateId(job.id));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.jobs.insert(job.id.clone(), Entry { seq, job });
        Ok(())
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> QueueResult<Option<Job>> {
        let mut inner = self.inner.write().map_err(|_| Self::poisoned())?;

        let next = inner
            .jobs
            .values()
            .filter(|e| e.job.is_eligible(now))
            .min_by_key(|e| (Reverse(e.job.priority), e.job.created_at, e.seq))
            .map(|e| e.job.id.clone());

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(entry) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };
        entry.job.state = JobState::Processing;
        entry.job.updated_at = now;
        Ok(Some(entry.job.clone()))
    }

    async fn update(&self, id: &JobId, update: JobUpdate) -> QueueResult<Job> {
        let mut inner = self.inner.write().map_err(|_| Self::poisoned())?;
        let entry = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;
        update.apply_to(&mut entry.job)?;
        Ok(entry.job.clone())
    }

    async fn get(&self, id: &JobId) -> QueueResult<Option<Job>> {
        let inner = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(inner.jobs.get(id).map(|e| e.job.clone()))
    }

    async fn list(&self, filter: &JobFilter) -> QueueResult<Vec<Job>> {
        let inner = self.inner.read().map_err(|_| Self::poisoned())?;
        let mut entries: Vec<&Entry> = inner
            .jobs
            .values()
            .filter(|e| filter.state.is_none_or(|s| e.job.state == s))
            .collect();
        sort_jobs(&mut entries, filter.order);

        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(entries.into_iter().take(limit).map(|e| e.job.clone()).collect())
    }

    async fn counts(&self) -> QueueResult<JobCounts> {
        let inner = self.inner.read().map_err(|_| Self::poisoned())?;
        let mut counts = JobCounts::default();
        for entry in inner.jobs.values() {
            counts.add(entry.job.state, 1);
        }
        Ok(counts)
    }

    async fn delete_all(&self) -> QueueResult<u64> {
        let mut inner = self.inner.write().map_err(|_| Self::poisoned())?;
        let removed = inner.jobs.len() as u64;
        inner.jobs.clear();
        Ok(removed)
    }
}

#[async_trait]
impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    async fn insert(&self, job: Job) -> QueueResult<()> {
        (**self).insert(job).await
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> QueueResult<Option<Job>> {
        (**self).claim_next(now).await
    }

    async fn update(&self, id: &JobId, update: JobUpdate) -> QueueResult<Job> {
        (**self).update(id, update).await
    }

    async fn get(&self, id: &JobId) -> QueueResult<Option<Job>> {
        (**self).get(id).await
    }

    async fn list(&self, filter: &JobFilter) -> QueueResult<Vec<Job>> {
        (**self).list(filter).await
    }

    async fn counts(&self) -> QueueResult<JobCounts> {
        (**self).counts().await
    }

    async fn delete_all(&self) -> QueueResult<u64> {
        (**self).delete_all().await
    }
}
