// src/server/initialization.rs

//! Builds the `ServerContext` from a loaded `Config`: opens the store,
//! clones/verifies the spec repository, and wires the orchestrator and its
//! collaborators together. Also exposes `init_only`, the subset of this
//! wiring the `--init-only` CLI flag exercises.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::info;

use crate::artifacts::ArtifactRenderer;
use crate::config::Config;
use crate::dhcp::DhcpDriver;
use crate::error::BootstrapError;
use crate::notify::Notifier;
use crate::orchestrator::Orchestrator;
use crate::queue::TaskQueue;
use crate::specloader::SpecLoader;
use crate::store::Store;

use super::context::ServerContext;

/// Number of task queue workers draining the `tasks` table. spec.md §5
/// requires at least four.
const TASK_QUEUE_WORKERS: usize = 4;

pub async fn setup(config: Config) -> Result<ServerContext, BootstrapError> {
    let store = Store::open(&config.pvc.database.path)?;

    let specloader = Arc::new(SpecLoader::new(config.pvc.ansible.clone()));
    specloader.ensure_cloned().await?;

    tokio::fs::create_dir_all(&config.pvc.tftp.root_path).await?;
    tokio::fs::create_dir_all(&config.pvc.tftp.host_path).await?;

    let renderer = Arc::new(ArtifactRenderer::new(&config.pvc));
    let notifier = Arc::new(Notifier::new(config.pvc.notifications.clone()));

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        specloader,
        renderer,
        notifier,
        config.pvc.ansible.clone(),
    ));

    let task_queue = Arc::new(TaskQueue::new(
        store.clone(),
        orchestrator.clone(),
        TASK_QUEUE_WORKERS,
    ));

    let dhcp = Arc::new(DhcpDriver::new(
        config.pvc.dhcp.clone(),
        config.pvc.tftp.clone(),
        config.pvc.api.port,
    ));

    let (shutdown_tx, _) = broadcast::channel(16);

    info!("initialization complete");
    Ok(ServerContext {
        config,
        store,
        orchestrator,
        task_queue,
        dhcp,
        shutdown_tx,
        background_tasks: JoinSet::new(),
    })
}

/// Performs just the idempotent first-run setup `--init-only` promises:
/// the store schema exists, the spec repository is cloned, and the TFTP
/// tree is present. No server loop is started.
pub async fn init_only(config: &Config) -> Result<(), BootstrapError> {
    Store::open(&config.pvc.database.path)?;

    let specloader = SpecLoader::new(config.pvc.ansible.clone());
    specloader.ensure_cloned().await?;

    tokio::fs::create_dir_all(&config.pvc.tftp.root_path).await?;
    tokio::fs::create_dir_all(&config.pvc.tftp.host_path).await?;

    info!("--init-only: store, spec repository, and TFTP root are ready");
    Ok(())
}
