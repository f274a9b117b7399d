// src/server/mod.rs

mod context;
mod initialization;
mod spawner;

pub use context::ServerContext;
pub use initialization::init_only;

use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::BootstrapError;

/// Brings up the store, spec loader, orchestrator, task queue, DHCP/TFTP
/// supervisor, and check-in API, then runs until a shutdown signal or any
/// background task exits on its own.
pub async fn run(config: Config) -> Result<(), BootstrapError> {
    let mut ctx = initialization::setup(config).await?;
    spawner::spawn_all(&mut ctx).await?;
    run_until_shutdown(ctx).await
}

async fn run_until_shutdown(mut ctx: ServerContext) -> Result<(), BootstrapError> {
    let mut outcome = Ok(());

    tokio::select! {
        _ = wait_for_signal() => {
            info!("shutdown signal received");
        }
        result = ctx.background_tasks.join_next() => {
            if let Some(result) = result {
                outcome = flatten(result);
                warn!("a background task exited on its own, shutting down");
            }
        }
    }

    ctx.shutdown_tx.send(()).ok();
    while let Some(result) = ctx.background_tasks.join_next().await {
        if let Err(e) = flatten(result) {
            error!("background task error during shutdown: {}", e);
            if outcome.is_ok() {
                outcome = Err(e);
            }
        }
    }

    info!("shutdown complete");
    outcome
}

fn flatten(
    result: Result<Result<(), BootstrapError>, tokio::task::JoinError>,
) -> Result<(), BootstrapError> {
    match result {
        Ok(inner) => inner,
        Err(join_err) => Err(BootstrapError::Runner(format!(
            "background task panicked: {join_err}"
        ))),
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    tokio::signal::ctrl_c().await.ok();
}
