use anyhow::Context;
use tokio::signal::unix::{SignalKind, signal};

/// Wait for SIGTERM or SIGINT.
pub async fn wait_for_signal() -> anyhow::Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, stopping workers");
        }
        _ = sigint.recv() => {
            tracing::info!("received SIGINT, stopping workers");
        }
    }
    Ok(())
}
