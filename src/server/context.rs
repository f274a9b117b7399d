// src/server/context.rs

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinSet;

use crate::config::Config;
use crate::dhcp::DhcpDriver;
use crate::error::BootstrapError;
use crate::orchestrator::Orchestrator;
use crate::queue::TaskQueue;
use crate::store::Store;

/// Holds everything wired up during `initialization::setup`, ready for
/// `spawner::spawn_all` to turn into running background tasks.
pub struct ServerContext {
    pub config: Config,
    pub store: Arc<Store>,
    pub orchestrator: Arc<Orchestrator>,
    pub task_queue: Arc<TaskQueue>,
    pub dhcp: Arc<DhcpDriver>,
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<Result<(), BootstrapError>>,
}
