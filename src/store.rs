// src/store.rs

//! Durable cluster+node registry backed by SQLite with foreign-key
//! enforcement. Every logical operation opens, commits, and closes its own
//! transaction (acquire-and-release scoping); a `tokio::sync::Mutex` around
//! the single `rusqlite::Connection` gives the engine-level write
//! serialization spec.md §4.1 requires without holding any transaction open
//! across an `.await` point.

use std::path::Path;
use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::Mutex;
use tracing::info;

use crate::error::BootstrapError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    Provisioning,
    AnsibleRunning,
    HooksRunning,
    Completed,
    Failed,
}

impl ClusterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterState::Provisioning => "provisioning",
            ClusterState::AnsibleRunning => "ansible-running",
            ClusterState::HooksRunning => "hooks-running",
            ClusterState::Completed => "completed",
            ClusterState::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "provisioning" => ClusterState::Provisioning,
            "ansible-running" => ClusterState::AnsibleRunning,
            "hooks-running" => ClusterState::HooksRunning,
            "completed" => ClusterState::Completed,
            "failed" => ClusterState::Failed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Init,
    Characterizing,
    PxeBooting,
    Installing,
    Installed,
    BootedInitial,
    BootedConfigured,
    BootedCompleted,
    Completed,
    Failed,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Init => "init",
            NodeState::Characterizing => "characterizing",
            NodeState::PxeBooting => "pxe-booting",
            NodeState::Installing => "installing",
            NodeState::Installed => "installed",
            NodeState::BootedInitial => "booted-initial",
            NodeState::BootedConfigured => "booted-configured",
            NodeState::BootedCompleted => "booted-completed",
            NodeState::Completed => "completed",
            NodeState::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "init" => NodeState::Init,
            "characterizing" => NodeState::Characterizing,
            "pxe-booting" => NodeState::PxeBooting,
            "installing" => NodeState::Installing,
            "installed" => NodeState::Installed,
            "booted-initial" => NodeState::BootedInitial,
            "booted-configured" => NodeState::BootedConfigured,
            "booted-completed" => NodeState::BootedCompleted,
            "completed" => NodeState::Completed,
            "failed" => NodeState::Failed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Cluster {
    pub id: i64,
    pub name: String,
    pub state: ClusterState,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: i64,
    pub cluster_id: i64,
    pub name: String,
    pub nid: i64,
    pub state: NodeState,
    pub bmc_macaddr: Option<String>,
    pub bmc_ipaddr: Option<String>,
    pub host_macaddr: Option<String>,
    pub host_ipaddr: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl TaskStatus {
    fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => TaskStatus::Pending,
            "in-progress" => TaskStatus::InProgress,
            "done" => TaskStatus::Done,
            "failed" => TaskStatus::Failed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct TaskRow {
    pub id: i64,
    pub handler: String,
    pub payload_json: String,
    pub status: TaskStatus,
    pub attempts: i64,
}

/// The `rusqlite::Connection` handle, wrapped for shared async access.
pub struct Store {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS clusters (
    id    INTEGER PRIMARY KEY AUTOINCREMENT,
    name  TEXT NOT NULL UNIQUE,
    state TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS nodes (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    cluster_id   INTEGER NOT NULL REFERENCES clusters(id) ON DELETE CASCADE,
    name         TEXT NOT NULL,
    nid          INTEGER NOT NULL,
    state        TEXT NOT NULL,
    bmc_macaddr  TEXT,
    bmc_ipaddr   TEXT,
    host_macaddr TEXT,
    host_ipaddr  TEXT,
    UNIQUE(cluster_id, name)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_nodes_bmc_mac
    ON nodes(cluster_id, bmc_macaddr) WHERE bmc_macaddr IS NOT NULL;

CREATE TABLE IF NOT EXISTS tasks (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    handler          TEXT NOT NULL,
    payload_json     TEXT NOT NULL,
    status           TEXT NOT NULL DEFAULT 'pending',
    attempts         INTEGER NOT NULL DEFAULT 0,
    lease_owner      TEXT,
    lease_expires_at TEXT,
    created_at       TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// How long a worker's lease on an in-progress task is honored before
/// another worker is allowed to re-lease it. Handlers that run longer than
/// this (the barrier handlers sleep for minutes) renew their lease
/// periodically from `queue`'s worker loop rather than relying on a single
/// long timeout, so this only needs to be long enough to survive one
/// renewal interval.
pub(crate) const TASK_LEASE_SECONDS: i64 = 60;

impl Store {
    /// Opens (creating if absent) the SQLite database at `path`, running the
    /// idempotent schema migration.
    pub fn open(path: &str) -> Result<Arc<Self>, BootstrapError> {
        if let Some(parent) = Path::new(path).parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        info!("store opened at {}", path);
        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
        }))
    }

    pub async fn get_cluster_by_name(
        &self,
        name: &str,
    ) -> Result<Option<Cluster>, BootstrapError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT id, name, state FROM clusters WHERE name = ?1",
                params![name],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(|(id, name, state)| Cluster {
            id,
            name,
            state: ClusterState::from_str(&state).unwrap_or(ClusterState::Failed),
        }))
    }

    pub async fn add_cluster(
        &self,
        name: &str,
        state: ClusterState,
    ) -> Result<Cluster, BootstrapError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO clusters (name, state) VALUES (?1, ?2)",
            params![name, state.as_str()],
        )?;
        let id = conn.last_insert_rowid();
        Ok(Cluster {
            id,
            name: name.to_string(),
            state,
        })
    }

    /// Compare-and-swap the cluster's state; returns `true` iff this call
    /// performed the transition (satisfies the barrier's exactly-once
    /// requirement, spec.md §4.9 "Barrier correctness").
    pub async fn cas_cluster_state(
        &self,
        name: &str,
        from: ClusterState,
        to: ClusterState,
    ) -> Result<bool, BootstrapError> {
        let conn = self.conn.lock().await;
        let rows = conn.execute(
            "UPDATE clusters SET state = ?1 WHERE name = ?2 AND state = ?3",
            params![to.as_str(), name, from.as_str()],
        )?;
        Ok(rows == 1)
    }

    pub async fn update_cluster_state(
        &self,
        name: &str,
        state: ClusterState,
    ) -> Result<(), BootstrapError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE clusters SET state = ?1 WHERE name = ?2",
            params![state.as_str(), name],
        )?;
        Ok(())
    }

    pub async fn get_node_by_name(
        &self,
        cluster_id: i64,
        name: &str,
    ) -> Result<Option<Node>, BootstrapError> {
        let conn = self.conn.lock().await;
        Self::query_node(
            &conn,
            "SELECT id, cluster_id, name, nid, state, bmc_macaddr, bmc_ipaddr, host_macaddr, host_ipaddr \
             FROM nodes WHERE cluster_id = ?1 AND name = ?2",
            params![cluster_id, name],
        )
    }

    pub async fn get_node_by_bmc_mac(
        &self,
        bmc_macaddr: &str,
    ) -> Result<Option<Node>, BootstrapError> {
        let conn = self.conn.lock().await;
        Self::query_node(
            &conn,
            "SELECT id, cluster_id, name, nid, state, bmc_macaddr, bmc_ipaddr, host_macaddr, host_ipaddr \
             FROM nodes WHERE bmc_macaddr = ?1",
            params![bmc_macaddr],
        )
    }

    fn query_node(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Option<Node>, BootstrapError> {
        let row = conn
            .query_row(sql, params, |row| {
                Ok(Node {
                    id: row.get(0)?,
                    cluster_id: row.get(1)?,
                    name: row.get(2)?,
                    nid: row.get(3)?,
                    state: NodeState::from_str(&row.get::<_, String>(4)?)
                        .unwrap_or(NodeState::Failed),
                    bmc_macaddr: row.get(5)?,
                    bmc_ipaddr: row.get(6)?,
                    host_macaddr: row.get(7)?,
                    host_ipaddr: row.get(8)?,
                })
            })
            .optional()?;
        Ok(row)
    }

    pub async fn list_nodes(&self, cluster_id: i64) -> Result<Vec<Node>, BootstrapError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, cluster_id, name, nid, state, bmc_macaddr, bmc_ipaddr, host_macaddr, host_ipaddr \
             FROM nodes WHERE cluster_id = ?1 ORDER BY nid",
        )?;
        let rows = stmt
            .query_map(params![cluster_id], |row| {
                Ok(Node {
                    id: row.get(0)?,
                    cluster_id: row.get(1)?,
                    name: row.get(2)?,
                    nid: row.get(3)?,
                    state: NodeState::from_str(&row.get::<_, String>(4)?)
                        .unwrap_or(NodeState::Failed),
                    bmc_macaddr: row.get(5)?,
                    bmc_ipaddr: row.get(6)?,
                    host_macaddr: row.get(7)?,
                    host_ipaddr: row.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Inserts a node in state `init`, deriving `nid` per DESIGN.md's
    /// resolution of the `nid`-derivation Open Question: digits from the
    /// hostname concatenated, falling back to a monotonic counter seeded
    /// from the cluster's current node count when the hostname has no
    /// digits at all.
    pub async fn add_node(&self, cluster_id: i64, name: &str) -> Result<Node, BootstrapError> {
        let conn = self.conn.lock().await;
        let existing_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM nodes WHERE cluster_id = ?1",
            params![cluster_id],
            |row| row.get(0),
        )?;
        let nid = derive_nid(name, existing_count);
        conn.execute(
            "INSERT INTO nodes (cluster_id, name, nid, state) VALUES (?1, ?2, ?3, ?4)",
            params![cluster_id, name, nid, NodeState::Init.as_str()],
        )?;
        let id = conn.last_insert_rowid();
        Ok(Node {
            id,
            cluster_id,
            name: name.to_string(),
            nid,
            state: NodeState::Init,
            bmc_macaddr: None,
            bmc_ipaddr: None,
            host_macaddr: None,
            host_ipaddr: None,
        })
    }

    pub async fn update_node_state(
        &self,
        cluster_id: i64,
        name: &str,
        state: NodeState,
    ) -> Result<(), BootstrapError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE nodes SET state = ?1 WHERE cluster_id = ?2 AND name = ?3",
            params![state.as_str(), cluster_id, name],
        )?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn update_node_addresses(
        &self,
        cluster_id: i64,
        name: &str,
        bmc_macaddr: &str,
        bmc_ipaddr: &str,
        host_macaddr: Option<&str>,
        host_ipaddr: Option<&str>,
    ) -> Result<(), BootstrapError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE nodes SET bmc_macaddr = ?1, bmc_ipaddr = ?2, host_macaddr = COALESCE(?3, host_macaddr), \
             host_ipaddr = COALESCE(?4, host_ipaddr) WHERE cluster_id = ?5 AND name = ?6",
            params![bmc_macaddr, bmc_ipaddr, host_macaddr, host_ipaddr, cluster_id, name],
        )?;
        Ok(())
    }

    // --- TaskQueue persistence (spec.md §4.8 / §9 "Task broker coupling") ---

    pub async fn enqueue_task(
        &self,
        handler: &str,
        payload_json: &str,
    ) -> Result<i64, BootstrapError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO tasks (handler, payload_json, status) VALUES (?1, ?2, 'pending')",
            params![handler, payload_json],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Leases the oldest pending task, or the oldest `in-progress` task
    /// whose lease has expired, recording `owner` and a fresh
    /// `lease_expires_at`. An `in-progress` row with a live lease is never
    /// re-selected, so two workers can't dispatch the same task
    /// concurrently; a row whose worker died before renewing or completing
    /// it becomes eligible again once its lease lapses, giving crash
    /// recovery without head-of-line-blocking newer pending rows behind it.
    pub async fn lease_next_task(&self, owner: &str) -> Result<Option<TaskRow>, BootstrapError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT id, handler, payload_json, status, attempts FROM tasks \
                 WHERE status = 'pending' \
                    OR (status = 'in-progress' \
                        AND (lease_expires_at IS NULL OR lease_expires_at <= datetime('now'))) \
                 ORDER BY id LIMIT 1",
                [],
                |row| {
                    Ok(TaskRow {
                        id: row.get(0)?,
                        handler: row.get(1)?,
                        payload_json: row.get(2)?,
                        status: TaskStatus::from_str(&row.get::<_, String>(3)?)
                            .unwrap_or(TaskStatus::Pending),
                        attempts: row.get(4)?,
                    })
                },
            )
            .optional()?;
        if let Some(task) = &row {
            conn.execute(
                "UPDATE tasks SET status = 'in-progress', attempts = attempts + 1, \
                 lease_owner = ?1, lease_expires_at = datetime('now', ?2) WHERE id = ?3",
                params![owner, format!("+{TASK_LEASE_SECONDS} seconds"), task.id],
            )?;
        }
        Ok(row)
    }

    /// Extends an owned lease so a still-running handler doesn't lose its
    /// task to another worker. Returns `false` if the task no longer
    /// belongs to `owner` (already completed, failed, or re-leased after
    /// this worker's lease lapsed).
    pub async fn renew_task_lease(&self, id: i64, owner: &str) -> Result<bool, BootstrapError> {
        let conn = self.conn.lock().await;
        let rows = conn.execute(
            "UPDATE tasks SET lease_expires_at = datetime('now', ?1) \
             WHERE id = ?2 AND status = 'in-progress' AND lease_owner = ?3",
            params![format!("+{TASK_LEASE_SECONDS} seconds"), id, owner],
        )?;
        Ok(rows == 1)
    }

    /// Only completes the row if `owner` still holds its lease, so a worker
    /// whose lease was taken over mid-dispatch (see `renew_task_lease`)
    /// can't mark done/failed a task another worker is now running.
    /// Returns `false` when ownership was lost.
    pub async fn mark_task_done(&self, id: i64, owner: &str) -> Result<bool, BootstrapError> {
        let conn = self.conn.lock().await;
        let rows = conn.execute(
            "UPDATE tasks SET status = 'done', lease_owner = NULL, lease_expires_at = NULL \
             WHERE id = ?1 AND status = 'in-progress' AND lease_owner = ?2",
            params![id, owner],
        )?;
        Ok(rows == 1)
    }

    pub async fn mark_task_failed(&self, id: i64, owner: &str) -> Result<bool, BootstrapError> {
        let conn = self.conn.lock().await;
        let rows = conn.execute(
            "UPDATE tasks SET status = 'failed', lease_owner = NULL, lease_expires_at = NULL \
             WHERE id = ?1 AND status = 'in-progress' AND lease_owner = ?2",
            params![id, owner],
        )?;
        Ok(rows == 1)
    }
}

/// See DESIGN.md Open Question 2.
fn derive_nid(hostname: &str, existing_count: i64) -> i64 {
    let digits: String = hostname.chars().filter(|c| c.is_ascii_digit()).collect();
    match digits.parse::<i64>() {
        Ok(n) if !digits.is_empty() => n,
        _ => existing_count + 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_tmp() -> (Arc<Store>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pvc.db");
        let store = Store::open(path.to_str().unwrap()).unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn derive_nid_uses_hostname_digits() {
        assert_eq!(derive_nid("n1", 0), 1);
        assert_eq!(derive_nid("host-42-a", 0), 42);
    }

    #[tokio::test]
    async fn derive_nid_falls_back_to_monotonic_counter() {
        assert_eq!(derive_nid("nodeone", 3), 4);
    }

    #[tokio::test]
    async fn cluster_and_node_roundtrip() {
        let (store, _dir) = open_tmp().await;
        let cluster = store
            .add_cluster("c1", ClusterState::Provisioning)
            .await
            .unwrap();
        let node = store.add_node(cluster.id, "n1").await.unwrap();
        assert_eq!(node.state, NodeState::Init);

        store
            .update_node_state(cluster.id, "n1", NodeState::Installing)
            .await
            .unwrap();
        let fetched = store
            .get_node_by_name(cluster.id, "n1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.state, NodeState::Installing);
    }

    #[tokio::test]
    async fn cluster_deletion_cascades_to_nodes() {
        let (store, _dir) = open_tmp().await;
        let cluster = store
            .add_cluster("c1", ClusterState::Provisioning)
            .await
            .unwrap();
        store.add_node(cluster.id, "n1").await.unwrap();
        {
            let conn = store.conn.lock().await;
            conn.execute("DELETE FROM clusters WHERE id = ?1", params![cluster.id])
                .unwrap();
        }
        let remaining = store.list_nodes(cluster.id).await.unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn cas_cluster_state_only_succeeds_once() {
        let (store, _dir) = open_tmp().await;
        store
            .add_cluster("c1", ClusterState::Provisioning)
            .await
            .unwrap();
        let first = store
            .cas_cluster_state(
                "c1",
                ClusterState::Provisioning,
                ClusterState::AnsibleRunning,
            )
            .await
            .unwrap();
        let second = store
            .cas_cluster_state(
                "c1",
                ClusterState::Provisioning,
                ClusterState::AnsibleRunning,
            )
            .await
            .unwrap();
        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn task_queue_lease_and_complete() {
        let (store, _dir) = open_tmp().await;
        let id = store.enqueue_task("host_checkin", "{}").await.unwrap();
        let leased = store.lease_next_task("worker-0").await.unwrap().unwrap();
        assert_eq!(leased.id, id);
        assert_eq!(leased.status, TaskStatus::Pending);
        assert!(store.mark_task_done(id, "worker-0").await.unwrap());
        assert!(store.lease_next_task("worker-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mark_task_done_is_a_noop_once_ownership_has_moved_on() {
        let (store, _dir) = open_tmp().await;
        let id = store.enqueue_task("host_checkin", "{}").await.unwrap();
        store.lease_next_task("worker-0").await.unwrap();
        // worker-0's lease lapsed and worker-1 took over the row.
        {
            let conn = store.conn.lock().await;
            conn.execute(
                "UPDATE tasks SET lease_expires_at = datetime('now', '-1 seconds') WHERE id = ?1",
                params![id],
            )
            .unwrap();
        }
        store.lease_next_task("worker-1").await.unwrap().unwrap();
        assert!(!store.mark_task_done(id, "worker-0").await.unwrap());
        assert!(store.mark_task_done(id, "worker-1").await.unwrap());
    }

    #[tokio::test]
    async fn an_active_lease_is_not_handed_to_a_second_worker() {
        let (store, _dir) = open_tmp().await;
        store.enqueue_task("dnsmasq_checkin", "{}").await.unwrap();
        let leased = store.lease_next_task("worker-0").await.unwrap().unwrap();
        // worker-1 polls while worker-0's lease is still live: nothing to do.
        assert!(store.lease_next_task("worker-1").await.unwrap().is_none());

        assert!(store.renew_task_lease(leased.id, "worker-0").await.unwrap());
        assert!(!store.renew_task_lease(leased.id, "worker-1").await.unwrap());
    }

    #[tokio::test]
    async fn newer_pending_tasks_are_not_blocked_behind_an_active_lease() {
        let (store, _dir) = open_tmp().await;
        let first = store.enqueue_task("dnsmasq_checkin", "{}").await.unwrap();
        store.lease_next_task("worker-0").await.unwrap().unwrap();
        let second = store.enqueue_task("host_checkin", "{}").await.unwrap();

        let leased = store.lease_next_task("worker-1").await.unwrap().unwrap();
        assert_eq!(leased.id, second);
        assert_ne!(leased.id, first);
    }
}
