use std::sync::Arc;

use anyhow::Context;

use queuectl_infra::QueueConfig;
use queuectl_infra::jobs::{JobQueue, ShellExecutor, SqliteJobStore};
use queuectl_infra::workers::WorkerPool;

mod shutdown;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    queuectl_observability::init();

    let config = QueueConfig::from_env();

    let store = SqliteJobStore::connect(&config.database_url)
        .await
        .with_context(|| format!("failed to open job store at {}", config.database_url))?;

    let queue = Arc::new(
        JobQueue::new(store.clone()).with_default_max_retries(config.default_max_retries),
    );

    let mut pool = WorkerPool::new(
        Arc::clone(&queue),
        Arc::new(ShellExecutor::new()),
        config.worker_config(),
    );
    pool.start(config.worker_count);

    tracing::info!(
        workers = config.worker_count,
        database_url = %config.database_url,
        "queuectl worker running"
    );

    shutdown::wait_for_signal().await?;
    pool.stop_all().await;

    let counts = queue.counts().await.context("failed to read job counts")?;
    tracing::info!(
        stats = %serde_json::to_string(&pool.stats())?,
        counts = %serde_json::to_string(&counts)?,
        total = counts.total(),
        "queuectl worker stopped"
    );

    store.close().await;
    Ok(())
}
