//! Worker pool: spawns N worker loops over one queue and stops them together.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::jobs::{CommandExecutor, JobQueue, JobStore};

use super::job_worker::{JobWorker, JobWorkerConfig, StatsCounters, WorkerStats};

/// Owns a set of worker tasks sharing one shutdown flag.
///
/// The pool never touches the store itself; all coordination between workers
/// happens through the store's atomic claim.
pub struct WorkerPool<S: JobStore + 'static> {
    queue: Arc<JobQueue<S>>,
    executor: Arc<dyn CommandExecutor>,
    config: JobWorkerConfig,
    stats: Arc<StatsCounters>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl<S: JobStore + 'static> WorkerPool<S> {
    pub fn new(
        queue: Arc<JobQueue<S>>,
        executor: Arc<dyn CommandExecutor>,
        config: JobWorkerConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            queue,
            executor,
            config,
            stats: Arc::new(StatsCounters::default()),
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    /// Spawn `n` workers named `worker-1..worker-n`, numbered after any workers
    /// already held by the pool. Must be called from within a tokio runtime.
    pub fn start(&mut self, n: usize) {
        // A previous stop_all leaves the flag raised.
        self.shutdown_tx.send_replace(false);

        let first = self.handles.len() + 1;
        for i in first..first + n {
            let worker = JobWorker::new(
                format!("worker-{i}"),
                Arc::clone(&self.queue),
                Arc::clone(&self.executor),
                self.config.clone(),
            )
            .with_stats(Arc::clone(&self.stats));
            let rx = self.shutdown_tx.subscribe();

            self.handles.push(tokio::spawn(worker.run(rx)));
        }

        info!(workers = n, "worker pool started");
    }

    /// Raise the stop flag and wait for every worker to finish its current job.
    pub async fn stop_all(&mut self) {
        self.shutdown_tx.send_replace(true);

        let handles = std::mem::take(&mut self.handles);
        let count = handles.len();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker task ended abnormally");
            }
        }

        info!(workers = count, "worker pool stopped");
    }

    /// Whether any worker loop is still alive.
    pub fn is_running(&self) -> bool {
        self.active_workers() > 0
    }

    pub fn active_workers(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.snapshot()
    }

    pub fn queue(&self) -> &Arc<JobQueue<S>> {
        &self.queue
    }
}
