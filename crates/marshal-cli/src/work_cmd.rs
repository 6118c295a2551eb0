//! The standalone worker process: run the pool until SIGINT/SIGTERM.

use anyhow::Result;
use tracing::info;

use crate::wiring::Runtime;

pub async fn run_workers(runtime: Runtime) -> Result<()> {
    runtime.worker_pool.start().await;
    info!(
        workers = runtime.config.worker_count,
        "worker pool running; waiting for shutdown signal"
    );

    shutdown_signal().await;

    info!("shutdown signal received; draining workers");
    runtime.worker_pool.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
