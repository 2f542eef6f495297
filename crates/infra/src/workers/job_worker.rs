//! The worker loop: claim, execute, report, pace.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use queuectl_core::{BackoffPolicy, Job, JobId, JobState, QueueResult};

use crate::jobs::{CommandExecutor, JobQueue, JobStore};

/// Worker loop configuration.
#[derive(Debug, Clone)]
pub struct JobWorkerConfig {
    /// Sleep between polls when nothing is eligible.
    pub idle_interval: Duration,
    /// Pause after a store error before trying again.
    pub store_retry_interval: Duration,
    /// How many times an outcome report is attempted before giving up.
    pub report_attempts: u32,
    /// Pacing after a failed attempt that will be retried.
    pub backoff: BackoffPolicy,
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_secs(1),
            store_retry_interval: Duration::from_secs(1),
            report_attempts: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl JobWorkerConfig {
    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    pub fn with_store_retry_interval(mut self, interval: Duration) -> Self {
        self.store_retry_interval = interval;
        self
    }

    pub fn with_report_attempts(mut self, attempts: u32) -> Self {
        self.report_attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Aggregate worker statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    /// Jobs executed, whatever the outcome.
    pub processed: u64,
    pub succeeded: u64,
    /// Failed attempts sent back to `pending`.
    pub failed: u64,
    pub dead_lettered: u64,
}

/// Shared counters behind [`WorkerStats`].
#[derive(Debug, Default)]
pub struct StatsCounters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
}

impl StatsCounters {
    fn record(&self, state: JobState) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match state {
            JobState::Completed => &self.succeeded,
            JobState::Dead => &self.dead_lettered,
            _ => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

/// What one iteration of the loop did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    /// Nothing eligible.
    Idle,
    /// A job ran and its outcome was recorded; carries the record after the transition.
    Processed(Job),
    /// A job ran but its outcome could not be recorded. It stays `processing`.
    Unreported(JobId),
}

enum Outcome {
    Success(String),
    Failure(String),
}

/// A single worker: claims one job at a time and drives it through the queue.
pub struct JobWorker<S: JobStore> {
    name: String,
    queue: Arc<JobQueue<S>>,
    executor: Arc<dyn CommandExecutor>,
    config: JobWorkerConfig,
    stats: Arc<StatsCounters>,
}

impl<S: JobStore> JobWorker<S> {
    pub fn new(
        name: impl Into<String>,
        queue: Arc<JobQueue<S>>,
        executor: Arc<dyn CommandExecutor>,
        config: JobWorkerConfig,
    ) -> Self {
        Self {
            name: name.into(),
            queue,
            executor,
            config,
            stats: Arc::new(StatsCounters::default()),
        }
    }

    /// Report into shared counters instead of private ones.
    pub fn with_stats(mut self, stats: Arc<StatsCounters>) -> Self {
        self.stats = stats;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.snapshot()
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// Shutdown is checked between iterations; a job in flight always finishes
    /// and gets its outcome recorded.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.name, "worker started");

        while !stop_requested(&shutdown) {
            let pause = match self.tick().await {
                Ok(Tick::Idle) => self.config.idle_interval,
                Ok(Tick::Processed(job)) if job.state == JobState::Pending => {
                    let delay = self.config.backoff.delay(job.attempts);
                    debug!(
                        worker = %self.name,
                        job_id = %job.id,
                        attempts = job.attempts,
                        delay_ms = delay.as_millis() as u64,
                        "backing off after failed attempt"
                    );
                    delay
                }
                Ok(Tick::Processed(_)) | Ok(Tick::Unreported(_)) => Duration::ZERO,
                Err(e) => {
                    error!(worker = %self.name, error = %e, "failed to acquire job");
                    self.config.store_retry_interval
                }
            };
            sleep_or_shutdown(&mut shutdown, pause).await;
        }

        info!(worker = %self.name, "worker stopped");
    }

    /// One iteration: claim at most one job, execute it and record the outcome.
    ///
    /// Errors are store errors from the claim; everything after the claim is
    /// handled here.
    pub async fn tick(&self) -> QueueResult<Tick> {
        let Some(job) = self.queue.acquire(self.queue.now()).await? else {
            return Ok(Tick::Idle);
        };

        info!(
            worker = %self.name,
            job_id = %job.id,
            attempt = job.attempts + 1,
            max_retries = job.max_retries,
            "executing job"
        );

        let outcome = match self.executor.execute(&job.command, job.timeout).await {
            Ok(out) if out.success() => Outcome::Success(out.stdout),
            Ok(out) => Outcome::Failure(out.failure_reason()),
            Err(e) => Outcome::Failure(e.to_string()),
        };

        match self.report(&job.id, &outcome).await {
            Ok(updated) => {
                self.stats.record(updated.state);
                Ok(Tick::Processed(updated))
            }
            Err(e) => {
                error!(
                    worker = %self.name,
                    job_id = %job.id,
                    error = %e,
                    "could not record job outcome, job left processing"
                );
                Ok(Tick::Unreported(job.id))
            }
        }
    }

    /// Record `outcome`, retrying transient store errors. Never re-executes.
    async fn report(&self, id: &JobId, outcome: &Outcome) -> QueueResult<Job> {
        let attempts = self.config.report_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = match outcome {
                Outcome::Success(stdout) => self.queue.complete(id, stdout.as_str()).await,
                Outcome::Failure(reason) => self.queue.fail(id, reason.as_str()).await,
            };
            match result {
                Ok(job) => return Ok(job),
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(
                        worker = %self.name,
                        job_id = %id,
                        attempt,
                        error = %e,
                        "store error while recording outcome, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.config.store_retry_interval).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn stop_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Sleep for `pause`, returning early once shutdown is requested.
async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, pause: Duration) {
    if pause.is_zero() || stop_requested(shutdown) {
        return;
    }
    tokio::select! {
        _ = tokio::time::sleep(pause) => {}
        _ = shutdown.wait_for(|stop| *stop) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use queuectl_core::{JobSpec, QueueError};

    use crate::jobs::{
        ExecError, ExecOutput, InMemoryJobStore, JobCounts, JobFilter, JobUpdate,
    };

    /// Returns the same result for every command.
    struct ScriptedExecutor {
        result: Result<ExecOutput, ExecError>,
        calls: AtomicU32,
    }

    impl ScriptedExecutor {
        fn exit(code: i32, stdout: &str, stderr: &str) -> Arc<Self> {
            Arc::new(Self {
                result: Ok(ExecOutput {
                    exit_code: Some(code),
                    stdout: stdout.to_string(),
                    stderr: stderr.to_string(),
                }),
                calls: AtomicU32::new(0),
            })
        }

        fn error(err: ExecError) -> Arc<Self> {
            Arc::new(Self {
                result: Err(err),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl CommandExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            _command: &str,
            _timeout: Option<Duration>,
        ) -> Result<ExecOutput, ExecError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    /// In-memory store whose first `failures` updates are rejected as unavailable.
    struct FlakyStore {
        inner: InMemoryJobStore,
        failures: AtomicU32,
    }

    #[async_trait]
    impl JobStore for FlakyStore {
        async fn insert(&self, job: Job) -> QueueResult<()> {
            self.inner.insert(job).await
        }

        async fn claim_next(&self, now: DateTime<Utc>) -> QueueResult<Option<Job>> {
            self.inner.claim_next(now).await
        }

        async fn update(&self, id: &JobId, update: JobUpdate) -> QueueResult<Job> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(QueueError::unavailable("database is locked"));
            }
            self.inner.update(id, update).await
        }

        async fn get(&self, id: &JobId) -> QueueResult<Option<Job>> {
            self.inner.get(id).await
        }

        async fn list(&self, filter: &JobFilter) -> QueueResult<Vec<Job>> {
            self.inner.list(filter).await
        }

        async fn counts(&self) -> QueueResult<JobCounts> {
            self.inner.counts().await
        }

        async fn delete_all(&self) -> QueueResult<u64> {
            self.inner.delete_all().await
        }
    }

    fn fast_config() -> JobWorkerConfig {
        JobWorkerConfig::default()
            .with_idle_interval(Duration::from_millis(10))
            .with_store_retry_interval(Duration::from_millis(1))
    }

    fn worker<S: JobStore>(
        queue: &Arc<JobQueue<S>>,
        executor: Arc<dyn CommandExecutor>,
    ) -> JobWorker<S> {
        JobWorker::new("worker-test", Arc::clone(queue), executor, fast_config())
    }

    #[tokio::test]
    async fn empty_queue_is_idle() {
        let queue = Arc::new(JobQueue::new(InMemoryJobStore::new()));
        let w = worker(&queue, ScriptedExecutor::exit(0, "", ""));

        assert_eq!(w.tick().await.unwrap(), Tick::Idle);
        assert_eq!(w.stats(), WorkerStats::default());
    }

    #[tokio::test]
    async fn success_completes_with_stdout() {
        let queue = Arc::new(JobQueue::new(InMemoryJobStore::new()));
        let job = queue.enqueue(JobSpec::new("echo hi")).await.unwrap();
        let w = worker(&queue, ScriptedExecutor::exit(0, "hi", ""));

        let Tick::Processed(done) = w.tick().await.unwrap() else {
            panic!("expected a processed job");
        };
        assert_eq!(done.id, job.id);
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.output.as_deref(), Some("hi"));
        assert_eq!(
            w.stats(),
            WorkerStats {
                processed: 1,
                succeeded: 1,
                ..WorkerStats::default()
            }
        );
    }

    #[tokio::test]
    async fn failures_retry_then_dead_letter() {
        let queue = Arc::new(JobQueue::new(InMemoryJobStore::new()));
        let job = queue
            .enqueue(JobSpec::new("false").with_max_retries(2))
            .await
            .unwrap();
        let w = worker(&queue, ScriptedExecutor::exit(1, "", ""));

        let Tick::Processed(first) = w.tick().await.unwrap() else {
            panic!("expected a processed job");
        };
        assert_eq!(first.state, JobState::Pending);
        assert_eq!(first.attempts, 1);
        assert_eq!(first.error.as_deref(), Some("exit code 1"));

        let Tick::Processed(second) = w.tick().await.unwrap() else {
            panic!("expected a processed job");
        };
        assert_eq!(second.id, job.id);
        assert_eq!(second.state, JobState::Dead);
        assert_eq!(second.attempts, 2);

        assert_eq!(w.tick().await.unwrap(), Tick::Idle);
        assert_eq!(
            w.stats(),
            WorkerStats {
                processed: 2,
                succeeded: 0,
                failed: 1,
                dead_lettered: 1,
            }
        );
    }

    #[tokio::test]
    async fn timeout_is_recorded_as_failure() {
        let queue = Arc::new(JobQueue::new(InMemoryJobStore::new()));
        queue
            .enqueue(JobSpec::new("sleep 10").with_timeout(Duration::from_secs(2)))
            .await
            .unwrap();
        let w = worker(
            &queue,
            ScriptedExecutor::error(ExecError::Timeout(Duration::from_secs(2))),
        );

        let Tick::Processed(job) = w.tick().await.unwrap() else {
            panic!("expected a processed job");
        };
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.error.as_deref(), Some("timeout after 2s"));
    }

    #[tokio::test]
    async fn transient_report_errors_are_retried_without_rerunning() {
        let store = FlakyStore {
            inner: InMemoryJobStore::new(),
            failures: AtomicU32::new(2),
        };
        let queue = Arc::new(JobQueue::new(store));
        queue.enqueue(JobSpec::new("echo ok")).await.unwrap();
        let executor = ScriptedExecutor::exit(0, "ok", "");
        let w = worker(&queue, executor.clone());

        let Tick::Processed(job) = w.tick().await.unwrap() else {
            panic!("expected a processed job");
        };
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_report_leaves_job_processing() {
        let store = FlakyStore {
            inner: InMemoryJobStore::new(),
            failures: AtomicU32::new(10),
        };
        let queue = Arc::new(JobQueue::new(store));
        let job = queue.enqueue(JobSpec::new("false")).await.unwrap();
        let executor = ScriptedExecutor::exit(1, "", "boom");
        let w = worker(&queue, executor.clone());

        assert_eq!(w.tick().await.unwrap(), Tick::Unreported(job.id.clone()));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);

        let stored = queue.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Processing);
        assert_eq!(stored.attempts, 0);
        assert_eq!(w.stats(), WorkerStats::default());
    }

    #[tokio::test]
    async fn shutdown_wakes_idle_worker() {
        let queue = Arc::new(JobQueue::new(InMemoryJobStore::new()));
        let w = JobWorker::new(
            "worker-idle",
            Arc::clone(&queue),
            ScriptedExecutor::exit(0, "", ""),
            JobWorkerConfig::default().with_idle_interval(Duration::from_secs(60)),
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(w.run(rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_wakes_worker_from_backoff() {
        let queue = Arc::new(JobQueue::new(InMemoryJobStore::new()));
        let job = queue
            .enqueue(JobSpec::new("false").with_max_retries(5))
            .await
            .unwrap();
        let w = JobWorker::new(
            "worker-backoff",
            Arc::clone(&queue),
            ScriptedExecutor::exit(1, "", ""),
            JobWorkerConfig::default().with_backoff(BackoffPolicy::fixed(Duration::from_secs(60))),
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(w.run(rx));

        // Wait for the first failure to be recorded, then stop mid-backoff.
        for _ in 0..200 {
            let current = queue.get(&job.id).await.unwrap().unwrap();
            if current.attempts == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker did not stop")
            .unwrap();

        let stored = queue.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.state, JobState::Pending);
    }
}
