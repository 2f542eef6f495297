//! Integration tests for the full job pipeline.
//!
//! Tests: enqueue → SqliteJobStore → WorkerPool → ShellExecutor → SqliteJobStore
//!
//! Verifies:
//! - Concurrent claimers never receive the same job, even through separate pools
//! - Outcomes, retries and dead-lettering are persisted end to end
//! - Dead jobs can be retried by an operator and then succeed
//! - Records survive reopening the database file

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use uuid::Uuid;

    use queuectl_core::{BackoffPolicy, Clock, JobId, JobSpec, JobState, ManualClock};

    use crate::jobs::{JobQueue, JobStore, ShellExecutor, SqliteJobStore};
    use crate::workers::{JobWorkerConfig, WorkerPool};

    /// A database file in the temp dir, removed (with its WAL files) on drop.
    struct TempDb {
        path: PathBuf,
    }

    impl TempDb {
        fn new() -> Self {
            Self {
                path: std::env::temp_dir().join(format!("queuectl-{}.db", Uuid::now_v7())),
            }
        }

        fn url(&self) -> String {
            format!("sqlite://{}", self.path.display())
        }
    }

    impl Drop for TempDb {
        fn drop(&mut self) {
            let base = self.path.display().to_string();
            for path in [base.clone(), format!("{base}-wal"), format!("{base}-shm")] {
                let _ = std::fs::remove_file(path);
            }
        }
    }

    fn fast_workers() -> JobWorkerConfig {
        JobWorkerConfig::default()
            .with_idle_interval(Duration::from_millis(10))
            .with_store_retry_interval(Duration::from_millis(10))
            .with_backoff(BackoffPolicy::fixed(Duration::from_millis(10)))
    }

    async fn wait_until<F, Fut>(mut done: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..1_000 {
            if done().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_claims_never_hand_out_the_same_job() {
        const ROUNDS: usize = 120;
        const JOBS: usize = 8;
        const CLAIMERS: usize = 6;

        let db = TempDb::new();
        // Two independent pools on one file, like two worker processes.
        let a = SqliteJobStore::connect(&db.url()).await.unwrap();
        let b = SqliteJobStore::connect(&db.url()).await.unwrap();
        let queue = JobQueue::new(a.clone());

        for round in 0..ROUNDS {
            a.delete_all().await.unwrap();
            for i in 0..JOBS {
                queue
                    .enqueue(JobSpec::new(format!("echo {round}-{i}")))
                    .await
                    .unwrap();
            }

            let now = queue.now();
            let mut tasks = Vec::new();
            for c in 0..CLAIMERS {
                let store = if c % 2 == 0 { a.clone() } else { b.clone() };
                tasks.push(tokio::spawn(async move {
                    let mut claimed = Vec::new();
                    while let Some(job) = store.claim_next(now).await.unwrap() {
                        claimed.push(job.id);
                    }
                    claimed
                }));
            }

            let mut seen = HashSet::new();
            let mut total = 0;
            for task in tasks {
                for id in task.await.unwrap() {
                    total += 1;
                    assert!(seen.insert(id.clone()), "round {round}: {id} claimed twice");
                }
            }
            assert_eq!(total, JOBS, "round {round}: every job claimed exactly once");
            assert_eq!(a.counts().await.unwrap().processing, JOBS);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn worker_pool_runs_jobs_end_to_end() {
        let db = TempDb::new();
        let store = SqliteJobStore::connect(&db.url()).await.unwrap();
        let queue = Arc::new(JobQueue::new(store));

        let mut ok_ids = Vec::new();
        for i in 0..5 {
            let job = queue
                .enqueue(JobSpec::new(format!("echo '  done {i}  '")))
                .await
                .unwrap();
            ok_ids.push(job.id);
        }
        let flaky = queue
            .enqueue(
                JobSpec::new("echo 'no such thing' >&2; exit 2")
                    .with_id("always-fails".parse().unwrap())
                    .with_max_retries(2),
            )
            .await
            .unwrap();
        let slow = queue
            .enqueue(
                JobSpec::new("sleep 5")
                    .with_timeout(Duration::from_millis(200))
                    .with_max_retries(1),
            )
            .await
            .unwrap();

        let mut pool = WorkerPool::new(
            Arc::clone(&queue),
            Arc::new(ShellExecutor::new()),
            fast_workers(),
        );
        pool.start(3);

        wait_until(|| {
            let queue = Arc::clone(&queue);
            async move {
                let counts = queue.counts().await.unwrap();
                counts.completed == 5 && counts.dead == 2
            }
        })
        .await;
        pool.stop_all().await;

        for (i, id) in ok_ids.iter().enumerate() {
            let job = queue.get(id).await.unwrap().unwrap();
            assert_eq!(job.state, JobState::Completed);
            assert_eq!(job.output, Some(format!("done {i}")));
            assert_eq!(job.attempts, 0);
        }

        let flaky = queue.get(&flaky.id).await.unwrap().unwrap();
        assert_eq!(flaky.state, JobState::Dead);
        assert_eq!(flaky.attempts, 2);
        assert_eq!(flaky.error.as_deref(), Some("no such thing"));

        let slow = queue.get(&slow.id).await.unwrap().unwrap();
        assert_eq!(slow.state, JobState::Dead);
        assert_eq!(slow.error.as_deref(), Some("timeout after 0.2s"));

        let stats = pool.stats();
        assert_eq!(stats.succeeded, 5);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.dead_lettered, 2);
        assert_eq!(stats.processed, 8);

        let dead: Vec<JobId> = queue
            .list_dead_letters()
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(dead.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn operator_retry_revives_dead_job() {
        let db = TempDb::new();
        let marker = std::env::temp_dir().join(format!("queuectl-marker-{}", Uuid::now_v7()));
        let store = SqliteJobStore::connect(&db.url()).await.unwrap();
        let queue = Arc::new(JobQueue::new(store));

        // Fails on the first run, succeeds once the marker exists.
        let command = format!(
            "if [ -f '{m}' ]; then echo recovered; else touch '{m}'; exit 1; fi",
            m = marker.display()
        );
        let job = queue
            .enqueue(JobSpec::new(command).with_max_retries(1))
            .await
            .unwrap();

        let mut pool = WorkerPool::new(
            Arc::clone(&queue),
            Arc::new(ShellExecutor::new()),
            fast_workers(),
        );
        pool.start(1);

        let id = job.id.clone();
        wait_until(|| {
            let (queue, id) = (Arc::clone(&queue), id.clone());
            async move { queue.get(&id).await.unwrap().unwrap().state == JobState::Dead }
        })
        .await;

        let dead = queue.get(&job.id).await.unwrap().unwrap();
        assert_eq!(dead.attempts, 1);
        assert_eq!(dead.error.as_deref(), Some("exit code 1"));

        let retried = queue.retry_dead_letter(&job.id).await.unwrap();
        assert_eq!(retried.attempts, 0);

        wait_until(|| {
            let (queue, id) = (Arc::clone(&queue), id.clone());
            async move { queue.get(&id).await.unwrap().unwrap().state == JobState::Completed }
        })
        .await;
        pool.stop_all().await;

        let done = queue.get(&job.id).await.unwrap().unwrap();
        assert_eq!(done.output.as_deref(), Some("recovered"));
        assert_eq!(done.error.as_deref(), Some("exit code 1"));
        let _ = std::fs::remove_file(marker);
    }

    #[tokio::test]
    async fn sqlite_queue_respects_priority_and_run_at() {
        let db = TempDb::new();
        let t0 = Utc.with_ymd_and_hms(2025, 11, 10, 16, 30, 0).unwrap();
        let clock = Arc::new(ManualClock::new(t0));
        let store = SqliteJobStore::connect(&db.url()).await.unwrap();
        let queue = JobQueue::new(store).with_clock(clock.clone());

        let a = queue
            .enqueue(JobSpec::new("a").with_priority(5))
            .await
            .unwrap();
        clock.advance(ChronoDuration::seconds(1));
        let b = queue
            .enqueue(JobSpec::new("b").with_priority(5))
            .await
            .unwrap();
        clock.advance(ChronoDuration::seconds(1));
        let c = queue
            .enqueue(JobSpec::new("c").with_priority(10))
            .await
            .unwrap();
        let delayed = queue
            .enqueue(
                JobSpec::new("delayed")
                    .with_priority(100)
                    .run_at(t0 + ChronoDuration::seconds(10)),
            )
            .await
            .unwrap();

        let mut order = Vec::new();
        while let Some(job) = queue.acquire(clock.now()).await.unwrap() {
            order.push(job.id);
        }
        assert_eq!(order, vec![c.id, a.id, b.id]);

        clock.set(t0 + ChronoDuration::seconds(9));
        assert!(queue.acquire(clock.now()).await.unwrap().is_none());

        clock.set(t0 + ChronoDuration::seconds(10));
        let due = queue.acquire(clock.now()).await.unwrap().unwrap();
        assert_eq!(due.id, delayed.id);
    }

    #[tokio::test]
    async fn records_survive_reopening_the_database() {
        let db = TempDb::new();
        let id: JobId = "persisted".parse().unwrap();
        {
            let store = SqliteJobStore::connect(&db.url()).await.unwrap();
            let queue = JobQueue::new(store.clone());
            queue
                .enqueue(JobSpec::new("echo hi").with_id(id.clone()).with_priority(3))
                .await
                .unwrap();
            let claimed = queue.acquire(queue.now()).await.unwrap().unwrap();
            queue.fail(&claimed.id, "exit code 1").await.unwrap();
            store.close().await;
        }

        let store = SqliteJobStore::connect(&db.url()).await.unwrap();
        let job = store.get(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.priority, 3);
        assert_eq!(job.error.as_deref(), Some("exit code 1"));
    }
}
