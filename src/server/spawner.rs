// src/server/spawner.rs

//! Spawns all of the server's long-running background tasks.

use super::context::ServerContext;
use crate::api;

/// Spawns the DHCP/TFTP supervisor, the task queue worker pool, and the
/// check-in HTTP API into the context's `JoinSet`, each with its own
/// subscription to the shared shutdown channel.
pub async fn spawn_all(ctx: &mut ServerContext) -> crate::error::Result<()> {
    let shutdown_tx = ctx.shutdown_tx.clone();
    let background_tasks = &mut ctx.background_tasks;

    let dhcp = ctx.dhcp.clone();
    let dhcp_shutdown = shutdown_tx.subscribe();
    background_tasks.spawn(async move { dhcp.run(dhcp_shutdown).await });

    let task_queue = ctx.task_queue.clone();
    let queue_shutdown_tx = shutdown_tx.clone();
    background_tasks.spawn(async move { task_queue.run(&queue_shutdown_tx).await });

    let api_config = ctx.config.pvc.api.clone();
    let store = ctx.store.clone();
    let api_shutdown = shutdown_tx.subscribe();
    background_tasks.spawn(async move { api::run(&api_config, store, api_shutdown).await });

    Ok(())
}
