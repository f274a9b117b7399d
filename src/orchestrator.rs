// src/orchestrator.rs

//! The control plane: dispatches leased tasks to the `dnsmasq_checkin` /
//! `host_checkin` state machine, owns the cluster barrier, and invokes the
//! external configuration runner. Grounded on `original_source/lib/lib.py`,
//! `lib/host.py`, and `lib/ansible.py`.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tracing::{info, warn};

use crate::api::{DnsmasqCheckin, HostCheckin};
use crate::artifacts::ArtifactRenderer;
use crate::config::AnsibleConfig;
use crate::error::BootstrapError;
use crate::hooks::HookRunner;
use crate::notify::{Notifier, Severity};
use crate::redfish;
use crate::specloader::{CSpec, SpecLoader};
use crate::store::{Cluster, ClusterState, Node, NodeState, Store};

pub struct Orchestrator {
    store: Arc<Store>,
    specloader: Arc<SpecLoader>,
    renderer: Arc<ArtifactRenderer>,
    notifier: Arc<Notifier>,
    hook_runner: HookRunner,
    ansible: AnsibleConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<Store>,
        specloader: Arc<SpecLoader>,
        renderer: Arc<ArtifactRenderer>,
        notifier: Arc<Notifier>,
        ansible: AnsibleConfig,
    ) -> Self {
        Self {
            store,
            specloader,
            renderer,
            notifier,
            hook_runner: HookRunner::new(ansible.clone()),
            ansible,
        }
    }

    /// Routes a leased task to its handler by name. Unknown handlers are a
    /// programming error (a queue row that outlives its code), not a
    /// transient failure, so they're reported rather than silently dropped.
    pub async fn dispatch(&self, handler: &str, payload_json: &str) -> Result<(), BootstrapError> {
        match handler {
            "dnsmasq_checkin" => self.dnsmasq_checkin(payload_json).await,
            "host_checkin" => self.host_checkin(payload_json).await,
            other => Err(BootstrapError::Runner(format!(
                "unknown task handler '{other}'"
            ))),
        }
    }

    async fn dnsmasq_checkin(&self, payload_json: &str) -> Result<(), BootstrapError> {
        let event: DnsmasqCheckin = serde_json::from_str(payload_json).unwrap_or_default();
        match event.action.as_deref() {
            Some("add") => {
                self.specloader.pull().await?;
                let cspec = self.specloader.load_cspec().await?;
                self.handle_dnsmasq_add(&cspec, &event).await
            }
            Some("tftp") => {
                info!(
                    "tftp checkin from destination {:?}",
                    event.ipaddr
                );
                Ok(())
            }
            other => {
                warn!("dnsmasq checkin with unhandled action {:?}, dropping", other);
                Ok(())
            }
        }
    }

    async fn handle_dnsmasq_add(
        &self,
        cspec: &CSpec,
        event: &DnsmasqCheckin,
    ) -> Result<(), BootstrapError> {
        let Some(macaddr) = event.macaddr.as_deref().map(str::to_lowercase) else {
            warn!("dnsmasq add checkin missing macaddr, dropping");
            return Ok(());
        };
        let Some(ipaddr) = event.ipaddr.as_deref() else {
            warn!("dnsmasq add checkin for {} missing ipaddr, dropping", macaddr);
            return Ok(());
        };

        let Some(entry) = cspec.bootstrap.get(&macaddr) else {
            warn!("device '{}' not in bootstrap map; ignoring", macaddr);
            return Ok(());
        };

        if self.store.get_node_by_bmc_mac(&macaddr).await?.is_some() {
            info!("device '{}' has already been bootstrapped; ignoring", macaddr);
            return Ok(());
        }

        self.notifier
            .send(
                Severity::Info,
                &format!(
                    "New host checkin from MAC {} as host {} in cluster {}",
                    macaddr, entry.node.fqdn, entry.node.cluster
                ),
            )
            .await;

        let is_redfish = match entry.bmc.redfish {
            Some(overridden) => overridden,
            None => redfish::check_redfish(ipaddr).await,
        };
        info!("is device '{}' Redfish capable? {}", macaddr, is_redfish);
        if !is_redfish {
            return Ok(());
        }

        let cluster = self
            .ensure_cluster_with_nodes(cspec, &entry.node.cluster)
            .await?;
        redfish::init_node(
            &self.store,
            &self.renderer,
            &self.notifier,
            cluster.id,
            &macaddr,
            ipaddr,
            entry,
        )
        .await
    }

    async fn host_checkin(&self, payload_json: &str) -> Result<(), BootstrapError> {
        let event: HostCheckin = serde_json::from_str(payload_json).unwrap_or_default();
        let Some(bmc_macaddr) = event.bmc_macaddr.as_deref().map(str::to_lowercase) else {
            warn!("host checkin missing bmc_macaddr, dropping");
            return Ok(());
        };
        let Some(action) = event.action.clone() else {
            warn!("host checkin from {} missing action, dropping", bmc_macaddr);
            return Ok(());
        };

        self.specloader.pull().await?;
        let cspec = self.specloader.load_cspec().await?;
        let Some(entry) = cspec.bootstrap.get(&bmc_macaddr).cloned() else {
            warn!("host checkin from unknown MAC '{}', dropping", bmc_macaddr);
            return Ok(());
        };
        let cluster_name = entry.node.cluster.clone();
        let hostname = entry.node.hostname.clone();
        info!("registering '{}' checkin for {}", action, hostname);

        match action.as_str() {
            "install-start" => {
                let cluster = self.ensure_cluster_with_nodes(&cspec, &cluster_name).await?;
                self.store
                    .update_node_addresses(
                        cluster.id,
                        &hostname,
                        &bmc_macaddr,
                        event.bmc_ipaddr.as_deref().unwrap_or_default(),
                        event.host_macaddr.as_deref(),
                        event.host_ipaddr.as_deref(),
                    )
                    .await?;
                self.store
                    .update_node_state(cluster.id, &hostname, NodeState::Installing)
                    .await?;
                self.notifier
                    .send(
                        Severity::Begin,
                        &format!(
                            "Cluster {cluster_name}: base install starting for host {hostname}"
                        ),
                    )
                    .await;
                Ok(())
            }
            "install-complete" => {
                let cluster = self.get_cluster(&cluster_name).await?;
                self.store
                    .update_node_state(cluster.id, &hostname, NodeState::Installed)
                    .await?;
                self.notifier
                    .send(
                        Severity::Success,
                        &format!(
                            "Cluster {cluster_name}: base install completed for host {hostname}"
                        ),
                    )
                    .await;
                Ok(())
            }
            "system-boot_initial" => self.handle_boot_initial(&cspec, &cluster_name, &hostname, &event).await,
            "system-boot_configured" => {
                self.handle_boot_configured(&cspec, &cluster_name, &hostname).await
            }
            "system-boot_completed" => {
                // Accepted for backward compatibility with installer images
                // that promote to `completed` via this action instead of
                // `system-boot_configured`; we've picked the latter as the
                // authoritative barrier path, so this only updates the
                // reporting node's own state.
                let cluster = self.get_cluster(&cluster_name).await?;
                self.store
                    .update_node_state(cluster.id, &hostname, NodeState::Completed)
                    .await?;
                Ok(())
            }
            other => {
                warn!("host checkin with unhandled action '{}', dropping", other);
                Ok(())
            }
        }
    }

    async fn handle_boot_initial(
        &self,
        cspec: &CSpec,
        cluster_name: &str,
        hostname: &str,
        event: &HostCheckin,
    ) -> Result<(), BootstrapError> {
        self.notifier
            .send(
                Severity::Info,
                &format!("Cluster {cluster_name}: registering first boot for host {hostname}"),
            )
            .await;

        let cluster = self.get_cluster(cluster_name).await?;
        self.store
            .update_node_addresses(
                cluster.id,
                hostname,
                event.bmc_macaddr.as_deref().unwrap_or_default(),
                event.bmc_ipaddr.as_deref().unwrap_or_default(),
                event.host_macaddr.as_deref(),
                event.host_ipaddr.as_deref(),
            )
            .await?;
        self.store
            .update_node_state(cluster.id, hostname, NodeState::BootedInitial)
            .await?;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let all_nodes = self.store.list_nodes(cluster.id).await?;
        let ready: Vec<Node> = all_nodes
            .iter()
            .filter(|n| n.state == NodeState::BootedInitial)
            .cloned()
            .collect();
        info!(
            "cluster {}: {}/{} nodes booted-initial",
            cluster_name,
            ready.len(),
            all_nodes.len()
        );
        if all_nodes.is_empty() || ready.len() < all_nodes.len() {
            return Ok(());
        }

        if !self
            .store
            .cas_cluster_state(cluster_name, ClusterState::Provisioning, ClusterState::AnsibleRunning)
            .await?
        {
            // Another concurrent check-in already won the barrier.
            return Ok(());
        }

        self.run_configuration_runner(&cluster, &ready, cspec).await
    }

    async fn handle_boot_configured(
        &self,
        cspec: &CSpec,
        cluster_name: &str,
        hostname: &str,
    ) -> Result<(), BootstrapError> {
        self.notifier
            .send(
                Severity::Info,
                &format!(
                    "Cluster {cluster_name}: registering post-configuration boot for host {hostname}"
                ),
            )
            .await;

        let cluster = self.get_cluster(cluster_name).await?;
        self.store
            .update_node_state(cluster.id, hostname, NodeState::BootedConfigured)
            .await?;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let all_nodes = self.store.list_nodes(cluster.id).await?;
        let ready = all_nodes
            .iter()
            .filter(|n| n.state == NodeState::BootedConfigured)
            .count();
        info!(
            "cluster {}: {}/{} nodes booted-configured",
            cluster_name,
            ready,
            all_nodes.len()
        );
        if all_nodes.is_empty() || ready < all_nodes.len() {
            return Ok(());
        }

        if !self
            .store
            .cas_cluster_state(cluster_name, ClusterState::AnsibleRunning, ClusterState::HooksRunning)
            .await?
        {
            return Ok(());
        }

        let hooks = cspec.hooks.get(cluster_name).cloned().unwrap_or_default();
        self.hook_runner
            .run_cluster_hooks(&self.store, &self.notifier, &cluster, &hooks)
            .await?;

        for node in &all_nodes {
            self.store
                .update_node_state(cluster.id, &node.name, NodeState::Completed)
                .await?;
        }

        info!(
            "cluster {}: hosts powering down, waiting 300s before marking completed",
            cluster_name
        );
        tokio::time::sleep(Duration::from_secs(300)).await;
        self.store
            .update_cluster_state(cluster_name, ClusterState::Completed)
            .await?;
        self.notifier
            .send(
                Severity::Completed,
                &format!("Cluster {cluster_name}: PVC bootstrap deployment completed"),
            )
            .await;
        Ok(())
    }

    /// Invokes the external configuration runner (`ansible-playbook`)
    /// against the freshly-stabilized cluster. Grounded on
    /// `original_source/lib/ansible.py::run_bootstrap`; `ansible_runner`
    /// has no Rust equivalent, so the playbook is shelled out to directly,
    /// matching the `tokio::process` idiom used in `dhcp.rs`.
    async fn run_configuration_runner(
        &self,
        cluster: &Cluster,
        ready_nodes: &[Node],
        cspec: &CSpec,
    ) -> Result<(), BootstrapError> {
        let domain = cspec
            .bootstrap
            .values()
            .find(|entry| entry.node.cluster == cluster.name)
            .map(|entry| entry.node.domain.clone())
            .unwrap_or_default();
        let inventory = build_inventory(&cluster.name, &domain, ready_nodes);

        info!(
            "waiting 60s before starting configuration run for cluster {}",
            cluster.name
        );
        tokio::time::sleep(Duration::from_secs(60)).await;

        self.notifier
            .send(
                Severity::Begin,
                &format!("Cluster {}: starting configuration run", cluster.name),
            )
            .await;

        let private_data_dir = tempfile::Builder::new()
            .prefix("pvc-ansible-bootstrap_")
            .tempdir()?;
        let inventory_path = private_data_dir.path().join("inventory.ini");
        tokio::fs::write(&inventory_path, &inventory).await?;

        let playbook = format!("{}/pvc.yml", self.ansible.path);
        let extra_vars = format!(
            "ansible_ssh_private_key_file={} bootstrap=yes",
            self.ansible.keyfile
        );

        let output = Command::new("ansible-playbook")
            .arg("-i")
            .arg(&inventory_path)
            .arg("--limit")
            .arg(&cluster.name)
            .arg(&playbook)
            .arg("--extra-vars")
            .arg(&extra_vars)
            .arg("--forks")
            .arg(ready_nodes.len().max(1).to_string())
            .arg("-vv")
            .stdin(Stdio::null())
            .output()
            .await?;

        info!(
            "configuration run for cluster {} exited with status {}",
            cluster.name, output.status
        );

        if output.status.success() {
            self.specloader
                .commit_repository(&format!(
                    "Cluster {}: bootstrap configuration run",
                    cluster.name
                ))
                .await?;
            self.specloader.push_repository().await?;
            self.notifier
                .send(
                    Severity::Success,
                    &format!("Cluster {}: completed configuration run", cluster.name),
                )
                .await;
            Ok(())
        } else {
            self.notifier
                .send(
                    Severity::Failure,
                    &format!(
                        "Cluster {}: failed configuration run; check pvc-bootstrapd logs",
                        cluster.name
                    ),
                )
                .await;
            Err(BootstrapError::Runner(format!(
                "ansible-playbook exited with status {}",
                output.status
            )))
        }
    }

    async fn get_cluster(&self, name: &str) -> Result<Cluster, BootstrapError> {
        self.store
            .get_cluster_by_name(name)
            .await?
            .ok_or_else(|| BootstrapError::NotFound(format!("cluster {name}")))
    }

    /// Gets or creates the cluster row, then gets or creates every node
    /// this cluster's cspec names, in state `init`. Reused by both the
    /// Redfish-capable dnsmasq add path and the host's `install-start`
    /// check-in, matching the original's repeated "ensure cluster exists"
    /// guard in both `redfish_init` and `host.installer_init`.
    async fn ensure_cluster_with_nodes(
        &self,
        cspec: &CSpec,
        cluster_name: &str,
    ) -> Result<Cluster, BootstrapError> {
        let cluster = match self.store.get_cluster_by_name(cluster_name).await? {
            Some(cluster) => cluster,
            None => {
                self.store
                    .add_cluster(cluster_name, ClusterState::Provisioning)
                    .await?
            }
        };

        if let Some(node_names) = cspec.bootstrap_nodes.get(cluster_name) {
            for name in node_names {
                if self.store.get_node_by_name(cluster.id, name).await?.is_none() {
                    self.store.add_node(cluster.id, name).await?;
                }
            }
        }

        Ok(cluster)
    }
}

/// Builds the in-memory Ansible-style inventory the configuration runner
/// consumes: one `[cluster]` group with one `name.domain ansible_host=ip`
/// line per node.
fn build_inventory(cluster_name: &str, domain: &str, nodes: &[Node]) -> String {
    let mut inventory = format!("[{cluster_name}]\n");
    for node in nodes {
        let host_ip = node.host_ipaddr.as_deref().unwrap_or("");
        inventory.push_str(&format!("{}.{} ansible_host={}\n", node.name, domain, host_ip));
    }
    inventory
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CspecFilesConfig;
    use crate::specloader::{BmcEntry, BootstrapEntry, Hook, NodeConfig, NodeEntry};
    use std::collections::HashMap;

    fn sample_ansible_config() -> AnsibleConfig {
        AnsibleConfig {
            path: "/srv/spec".to_string(),
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
        }
    }

    fn disabled_notifier() -> Notifier {
        Notifier::new(crate::config::NotificationsConfig {
            enabled: false,
            uri: "http://127.0.0.1:1/unused".to_string(),
            action: "post".to_string(),
            icons: HashMap::new(),
            body: "{message}".to_string(),
            completed_triggerword: "completed".to_string(),
        })
    }

    fn sample_cspec(redfish_override: Option<bool>) -> CSpec {
        let mut cspec = CSpec::default();
        cspec.bootstrap.insert(
            "aa:bb:cc:dd:ee:ff".to_string(),
            BootstrapEntry {
                bmc: BmcEntry {
                    username: "admin".to_string(),
                    password: "secret".to_string(),
                    redfish: redfish_override,
                    bios_settings: HashMap::new(),
                    manager_settings: HashMap::new(),
                },
                node: NodeEntry {
                    cluster: "c1".to_string(),
                    hostname: "n1".to_string(),
                    domain: "bootstrap.local".to_string(),
                    fqdn: "n1.bootstrap.local".to_string(),
                    config: NodeConfig {
                        release: None,
                        filesystem: None,
                        packages: None,
                        kernel_options: None,
                        system_disks: vec![],
                    },
                },
            },
        );
        cspec
            .bootstrap_nodes
            .insert("c1".to_string(), vec!["n1".to_string()]);
        cspec.hooks.insert("c1".to_string(), Vec::<Hook>::new());
        cspec
    }

    async fn orchestrator_with_store() -> (Orchestrator, Arc<Store>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("pvc.db");
        let store = Store::open(db_path.to_str().unwrap()).unwrap();
        let ansible = sample_ansible_config();
        let specloader = Arc::new(SpecLoader::new(ansible.clone()));
        let renderer = Arc::new(ArtifactRenderer::new(&crate::config::PvcConfig {
            debug: false,
            deploy_username: "deploy".to_string(),
            database: crate::config::DatabaseConfig {
                path: db_path.to_str().unwrap().to_string(),
            },
            api: crate::config::ApiConfig {
                address: "0.0.0.0".to_string(),
                port: 8080,
            },
            queue: crate::config::QueueConfig {
                address: "127.0.0.1".to_string(),
                port: 8081,
                path: dir.path().join("queue").to_str().unwrap().to_string(),
            },
            dhcp: crate::config::DhcpConfig {
                address: "10.0.0.1".to_string(),
                gateway: "10.0.0.1".to_string(),
                domain: "bootstrap.local".to_string(),
                lease_start: "10.0.0.100".to_string(),
                lease_end: "10.0.0.200".to_string(),
                lease_time: "1h".to_string(),
            },
            tftp: crate::config::TftpConfig {
                root_path: dir.path().join("tftp").to_str().unwrap().to_string(),
                host_path: dir.path().join("tftp/hosts").to_str().unwrap().to_string(),
            },
            ansible: ansible.clone(),
            notifications: crate::config::NotificationsConfig {
                enabled: false,
                uri: "http://127.0.0.1:1/unused".to_string(),
                action: "post".to_string(),
                icons: HashMap::new(),
                body: "{message}".to_string(),
                completed_triggerword: "completed".to_string(),
            },
            mirror: None,
        }));
        let notifier = Arc::new(disabled_notifier());
        let orchestrator = Orchestrator::new(
            store.clone(),
            specloader,
            renderer,
            notifier,
            ansible,
        );
        (orchestrator, store, dir)
    }

    #[test]
    fn build_inventory_includes_all_node_fqdns() {
        let nodes = vec![
            Node {
                id: 1,
                cluster_id: 1,
                name: "n1".to_string(),
                nid: 1,
                state: NodeState::BootedInitial,
                bmc_macaddr: None,
                bmc_ipaddr: None,
                host_macaddr: None,
                host_ipaddr: Some("10.0.0.11".to_string()),
            },
            Node {
                id: 2,
                cluster_id: 1,
                name: "n2".to_string(),
                nid: 2,
                state: NodeState::BootedInitial,
                bmc_macaddr: None,
                bmc_ipaddr: None,
                host_macaddr: None,
                host_ipaddr: Some("10.0.0.12".to_string()),
            },
        ];
        let inventory = build_inventory("c1", "bootstrap.local", &nodes);
        assert!(inventory.starts_with("[c1]\n"));
        assert!(inventory.contains("n1.bootstrap.local ansible_host=10.0.0.11"));
        assert!(inventory.contains("n2.bootstrap.local ansible_host=10.0.0.12"));
    }

    #[tokio::test]
    async fn unknown_mac_is_dropped_without_store_writes() {
        let (orchestrator, store, _dir) = orchestrator_with_store().await;
        let cspec = sample_cspec(Some(false));
        let event = DnsmasqCheckin {
            action: Some("add".to_string()),
            macaddr: Some("00:11:22:33:44:55".to_string()),
            ipaddr: Some("10.0.0.10".to_string()),
            ..Default::default()
        };
        orchestrator
            .handle_dnsmasq_add(&cspec, &event)
            .await
            .unwrap();
        assert!(store.get_cluster_by_name("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn non_redfish_device_is_registered_without_redfish_session() {
        let (orchestrator, store, _dir) = orchestrator_with_store().await;
        // `redfish: Some(false)` means the capability probe is skipped
        // entirely, so this never touches the network.
        let cspec = sample_cspec(Some(false));
        let event = DnsmasqCheckin {
            action: Some("add".to_string()),
            macaddr: Some("AA:BB:CC:DD:EE:FF".to_string()),
            ipaddr: Some("10.0.0.10".to_string()),
            ..Default::default()
        };
        orchestrator
            .handle_dnsmasq_add(&cspec, &event)
            .await
            .unwrap();
        // Mac-case-insensitivity (P4): the uppercase lease MAC matched the
        // lowercase cspec key, but since this device isn't Redfish-capable
        // no cluster/node rows are created yet.
        assert!(store.get_cluster_by_name("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_mac_add_is_dropped_once_registered() {
        let (orchestrator, store, _dir) = orchestrator_with_store().await;
        let cspec = sample_cspec(Some(false));
        let cluster = store.add_cluster("c1", ClusterState::Provisioning).await.unwrap();
        store.add_node(cluster.id, "n1").await.unwrap();
        store
            .update_node_addresses(cluster.id, "n1", "aa:bb:cc:dd:ee:ff", "10.0.0.10", None, None)
            .await
            .unwrap();

        let event = DnsmasqCheckin {
            action: Some("add".to_string()),
            macaddr: Some("aa:bb:cc:dd:ee:ff".to_string()),
            ipaddr: Some("10.0.0.10".to_string()),
            ..Default::default()
        };
        // Should return Ok without panicking or attempting a second
        // Redfish session; the node's state is left untouched.
        orchestrator
            .handle_dnsmasq_add(&cspec, &event)
            .await
            .unwrap();
        let node = store.get_node_by_name(cluster.id, "n1").await.unwrap().unwrap();
        assert_eq!(node.state, NodeState::Init);
    }

    #[tokio::test]
    async fn three_node_barrier_transitions_exactly_once() {
        let (_orchestrator, store, _dir) = orchestrator_with_store().await;
        let cluster = store.add_cluster("c1", ClusterState::Provisioning).await.unwrap();
        for name in ["n1", "n2", "n3"] {
            store.add_node(cluster.id, name).await.unwrap();
        }

        // n2 arrives first: not all nodes are ready yet.
        store
            .update_node_state(cluster.id, "n2", NodeState::BootedInitial)
            .await
            .unwrap();
        let all = store.list_nodes(cluster.id).await.unwrap();
        let ready = all.iter().filter(|n| n.state == NodeState::BootedInitial).count();
        assert!(ready < all.len());

        // n1 arrives: still not all ready.
        store
            .update_node_state(cluster.id, "n1", NodeState::BootedInitial)
            .await
            .unwrap();
        let all = store.list_nodes(cluster.id).await.unwrap();
        let ready = all.iter().filter(|n| n.state == NodeState::BootedInitial).count();
        assert!(ready < all.len());

        // n3 arrives last: every node is now ready, so exactly one CAS wins.
        store
            .update_node_state(cluster.id, "n3", NodeState::BootedInitial)
            .await
            .unwrap();
        let all = store.list_nodes(cluster.id).await.unwrap();
        let ready = all.iter().filter(|n| n.state == NodeState::BootedInitial).count();
        assert_eq!(ready, all.len());

        let first = store
            .cas_cluster_state("c1", ClusterState::Provisioning, ClusterState::AnsibleRunning)
            .await
            .unwrap();
        let second = store
            .cas_cluster_state("c1", ClusterState::Provisioning, ClusterState::AnsibleRunning)
            .await
            .unwrap();
        assert!(first);
        assert!(!second);
    }
}
