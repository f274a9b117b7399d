// src/queue.rs

//! In-process durable task broker: a pool of workers draining the
//! `Store`-backed `tasks` table and handing each row to the
//! `Orchestrator`. Substitutes for the original Celery/Redis broker per
//! Design Notes §9; the supervised-worker/shutdown idiom is carried over
//! from `dhcp.rs`'s subprocess supervision loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::error::BootstrapError;
use crate::orchestrator::Orchestrator;
use crate::store::{Store, TASK_LEASE_SECONDS};

/// How long an idle worker waits before re-polling an empty queue.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How often an in-flight task's lease is renewed. Half the lease duration
/// gives one missed renewal's worth of slack before another worker would
/// consider the task abandoned.
const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(TASK_LEASE_SECONDS as u64 / 2);

pub struct TaskQueue {
    store: Arc<Store>,
    orchestrator: Arc<Orchestrator>,
    worker_count: usize,
}

impl TaskQueue {
    pub fn new(store: Arc<Store>, orchestrator: Arc<Orchestrator>, worker_count: usize) -> Self {
        Self {
            store,
            orchestrator,
            worker_count: worker_count.max(1),
        }
    }

    /// Runs `worker_count` workers until every one observes shutdown.
    /// Each worker gets its own receiver off the same broadcast channel so
    /// one shutdown signal reaches all of them.
    pub async fn run(&self, shutdown_tx: &broadcast::Sender<()>) -> Result<(), BootstrapError> {
        let mut workers = tokio::task::JoinSet::new();
        for id in 0..self.worker_count {
            let store = self.store.clone();
            let orchestrator = self.orchestrator.clone();
            let shutdown_rx = shutdown_tx.subscribe();
            workers.spawn(worker_loop(id, store, orchestrator, shutdown_rx));
        }

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!("task queue worker panicked: {}", e);
            }
        }
        Ok(())
    }
}

async fn worker_loop(
    id: usize,
    store: Arc<Store>,
    orchestrator: Arc<Orchestrator>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    info!("task queue worker {} starting", id);
    let owner = format!("worker-{id}");
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                info!("task queue worker {} shutting down", id);
                return;
            }
            task = store.lease_next_task(&owner) => {
                match task {
                    Ok(Some(task)) => {
                        info!(
                            "worker {} leased task {} ({}, attempt {})",
                            id, task.id, task.handler, task.attempts
                        );
                        let result = dispatch_with_lease_renewal(
                            &store, &orchestrator, &owner, task.id, &task.handler, &task.payload_json,
                        )
                        .await;
                        match result {
                            Ok(()) => {
                                match store.mark_task_done(task.id, &owner).await {
                                    Ok(true) => {}
                                    Ok(false) => warn!(
                                        "worker {} finished task {} but its lease had already passed to another worker; not marking done",
                                        id, task.id
                                    ),
                                    Err(e) => error!("worker {} failed to mark task {} done: {}", id, task.id, e),
                                }
                            }
                            Err(e) => {
                                // spec.md §7: handler failures are terminal, not
                                // retried — `mark_task_failed` leaves the row out
                                // of `lease_next_task`'s re-lease set for good.
                                warn!(
                                    "worker {} task {} ({}) failed: {}",
                                    id, task.id, task.handler, e
                                );
                                match store.mark_task_failed(task.id, &owner).await {
                                    Ok(true) => {}
                                    Ok(false) => warn!(
                                        "worker {} task {} lease had already passed to another worker; not marking failed",
                                        id, task.id
                                    ),
                                    Err(e) => error!("worker {} failed to mark task {} failed: {}", id, task.id, e),
                                }
                            }
                        }
                    }
                    Ok(None) => {
                        tokio::time::sleep(POLL_INTERVAL).await;
                    }
                    Err(e) => {
                        error!("worker {} failed to lease a task: {}", id, e);
                        tokio::time::sleep(POLL_INTERVAL).await;
                    }
                }
            }
        }
    }
}

/// Runs the handler while periodically renewing its lease, so barrier
/// handlers that sleep for minutes (`orchestrator::handle_boot_configured`)
/// don't have their task re-leased out from under them by another worker.
/// If a renewal finds the lease already gone to another worker, dispatch is
/// abandoned immediately rather than left racing the new owner to
/// completion — best-effort, since side effects already performed by the
/// handler (e.g. a BMC action already sent) can't be undone.
async fn dispatch_with_lease_renewal(
    store: &Store,
    orchestrator: &Orchestrator,
    owner: &str,
    task_id: i64,
    handler: &str,
    payload_json: &str,
) -> Result<(), BootstrapError> {
    let dispatch_fut = orchestrator.dispatch(handler, payload_json);
    tokio::pin!(dispatch_fut);
    loop {
        tokio::select! {
            result = &mut dispatch_fut => return result,
            _ = tokio::time::sleep(LEASE_RENEW_INTERVAL) => {
                match store.renew_task_lease(task_id, owner).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!("lease for task {} was lost mid-dispatch by {}, abandoning", task_id, owner);
                        return Err(BootstrapError::Runner(format!(
                            "task {task_id} lease lost mid-dispatch"
                        )));
                    }
                    Err(e) => error!("failed to renew lease for task {}: {}", task_id, e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactRenderer;
    use crate::config::*;
    use crate::notify::Notifier;
    use crate::specloader::SpecLoader;
    use std::collections::HashMap;

    fn sample_config(dir: &std::path::Path) -> PvcConfig {
        let ansible = AnsibleConfig {
            path: dir.join("spec").to_str().unwrap().to_string(),
            keyfile: "/etc/pvc-bootstrapd/deploy.key".to_string(),
            remote: "git@example.com:pvc/spec.git".to_string(),
            branch: "main".to_string(),
            clusters_file: "clusters.yml".to_string(),
            cspec_files: CspecFilesConfig {
                base: "base.yml".to_string(),
                pvc: "pvc.yml".to_string(),
                bootstrap: "bootstrap.yml".to_string(),
            },
            deploy_username_ssh: "deploy".to_string(),
        };
        PvcConfig {
            debug: false,
            deploy_username: "deploy".to_string(),
            database: DatabaseConfig {
                path: dir.join("pvc.db").to_str().unwrap().to_string(),
            },
            api: ApiConfig {
                address: "0.0.0.0".to_string(),
                port: 8080,
            },
            queue: QueueConfig {
                address: "127.0.0.1".to_string(),
                port: 8081,
                path: dir.join("queue").to_str().unwrap().to_string(),
            },
            dhcp: DhcpConfig {
                address: "10.0.0.1".to_string(),
                gateway: "10.0.0.1".to_string(),
                domain: "bootstrap.local".to_string(),
                lease_start: "10.0.0.100".to_string(),
                lease_end: "10.0.0.200".to_string(),
                lease_time: "1h".to_string(),
            },
            tftp: TftpConfig {
                root_path: dir.join("tftp").to_str().unwrap().to_string(),
                host_path: dir.join("tftp/hosts").to_str().unwrap().to_string(),
            },
            ansible,
            notifications: NotificationsConfig {
                enabled: false,
                uri: "http://127.0.0.1:1/unused".to_string(),
                action: "post".to_string(),
                icons: HashMap::new(),
                body: "{message}".to_string(),
                completed_triggerword: "completed".to_string(),
            },
            mirror: None,
        }
    }

    #[tokio::test]
    async fn worker_drains_an_unknown_handler_as_a_terminal_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = sample_config(dir.path());
        let store = Store::open(&config.database.path).unwrap();
        let specloader = Arc::new(SpecLoader::new(config.ansible.clone()));
        let renderer = Arc::new(ArtifactRenderer::new(&config));
        let notifier = Arc::new(Notifier::new(config.notifications.clone()));
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            specloader,
            renderer,
            notifier,
            config.ansible.clone(),
        ));

        store.enqueue_task("not_a_real_handler", "{}").await.unwrap();

        let queue = TaskQueue::new(store.clone(), orchestrator, 2);
        let (shutdown_tx, _rx) = broadcast::channel(1);
        let run_handle = tokio::spawn({
            let shutdown_tx = shutdown_tx.clone();
            async move { queue.run(&shutdown_tx).await }
        });

        // Give a worker a chance to lease and fail the bogus task before
        // stopping the pool.
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(()).ok();
        run_handle.await.unwrap().unwrap();

        // The bogus task never re-appears as leasable: it's parked in the
        // terminal `failed` status.
        assert!(store.lease_next_task("worker-verify").await.unwrap().is_none());
    }
}
