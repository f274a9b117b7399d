// src/specloader.rs

//! Pulls the cluster-spec repository and parses it into the in-memory
//! `CSpec`. Grounded on `original_source/lib/git.py`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fd_lock::RwLock as FdRwLock;
use serde::Deserialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::config::AnsibleConfig;
use crate::error::BootstrapError;

#[derive(Debug, Clone, Deserialize)]
pub struct BmcEntry {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub redfish: Option<bool>,
    #[serde(default)]
    pub bios_settings: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub manager_settings: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub release: Option<String>,
    #[serde(default)]
    pub filesystem: Option<String>,
    #[serde(default)]
    pub packages: Option<Vec<String>>,
    #[serde(default)]
    pub kernel_options: Option<Vec<String>>,
    #[serde(default)]
    pub system_disks: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeEntry {
    pub cluster: String,
    pub hostname: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub fqdn: String,
    #[serde(default)]
    pub config: NodeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapEntry {
    pub bmc: BmcEntry,
    pub node: NodeEntry,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Hook {
    pub name: String,
    #[serde(rename = "type")]
    pub hook_type: Option<String>,
    #[serde(default)]
    pub target: HookTarget,
    #[serde(default)]
    pub args: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum HookTarget {
    All(String),
    Nodes(Vec<String>),
}

impl Default for HookTarget {
    fn default() -> Self {
        HookTarget::All("all".to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct BaseYaml {
    local_domain: String,
}

/// The per-cluster `pvc.yml` document. Its shape is free-form cluster-wide
/// PVC configuration (storage pools, network layout) that this daemon
/// doesn't interpret itself — matching `original_source/lib/
/// git.py::load_pvc_yaml`, which loads and stashes it without reading any
/// particular key back out. Kept around on `CSpec` for hook/runner stages
/// that may need to inspect it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct PvcYaml(pub serde_yaml::Mapping);

#[derive(Debug, Clone, Deserialize)]
struct ClustersYaml {
    clusters: Vec<String>,
}

/// The fully-loaded, in-memory cluster specification. Rebuilt on each
/// orchestrator ingest so it is immutable for the duration of one
/// check-in's handling (spec.md §3 "Ownership").
#[derive(Debug, Clone, Default)]
pub struct CSpec {
    /// Keyed by lowercased BMC MAC address.
    pub bootstrap: HashMap<String, BootstrapEntry>,
    /// Keyed by cluster name.
    pub hooks: HashMap<String, Vec<Hook>>,
    pub bootstrap_nodes: HashMap<String, Vec<String>>,
    /// Keyed by cluster name; the cluster's `pvc.yml` document.
    pub pvc: HashMap<String, PvcYaml>,
}

pub struct SpecLoader {
    config: AnsibleConfig,
    repo_path: PathBuf,
    lock_path: PathBuf,
    /// Serializes in-process git mutations alongside the cross-process
    /// `fd-lock`, so two tasks in the same daemon don't race on the same
    /// `git2::Repository` handle while waiting on the file lock.
    mutate_guard: AsyncMutex<()>,
}

impl SpecLoader {
    pub fn new(config: AnsibleConfig) -> Self {
        let repo_path = PathBuf::from(&config.path);
        let lock_path = repo_path.with_extension("git.lock");
        Self {
            config,
            repo_path,
            lock_path,
            mutate_guard: AsyncMutex::new(()),
        }
    }

    /// Clones the repo if it doesn't exist locally yet. Exempt from the
    /// advisory lock: this only ever runs once, before any concurrent
    /// check-in handling starts.
    pub async fn ensure_cloned(&self) -> Result<(), BootstrapError> {
        let repo_path = self.repo_path.clone();
        let remote = self.config.remote.clone();
        let branch = self.config.branch.clone();
        tokio::task::spawn_blocking(move || -> Result<(), BootstrapError> {
            if repo_path.join(".git").exists() {
                return Ok(());
            }
            info!("cloning spec repository {} into {:?}", remote, repo_path);
            let mut builder = git2::build::RepoBuilder::new();
            builder.branch(&branch);
            builder.clone(&remote, &repo_path)?;
            Ok(())
        })
        .await
        .expect("spawn_blocking join")?;
        Ok(())
    }

    /// Fetches and fast-forwards the local working tree to the remote
    /// tracking branch. See DESIGN.md Open Question 3 for why this
    /// fetch+reset sequence stands in for the original's
    /// `pull(rebase=True)`.
    pub async fn pull(&self) -> Result<(), BootstrapError> {
        self.with_lock(|repo| {
            let branch = repo_branch_name(repo)?;
            let mut remote = repo.find_remote("origin")?;
            remote.fetch(&[&branch], None, None)?;
            let fetch_head = repo.find_reference("FETCH_HEAD")?;
            let fetch_commit = repo.reference_to_annotated_commit(&fetch_head)?;
            let target_oid = fetch_commit.id();
            let branch_ref = repo.find_branch(&branch, git2::BranchType::Local)?;
            let refname = branch_ref
                .get()
                .name()
                .ok_or_else(|| git2::Error::from_str("local branch reference has no name"))?
                .to_string();
            repo.reference(&refname, target_oid, true, "fast-forward")?;
            repo.set_head(&refname)?;
            repo.checkout_head(Some(git2::build::CheckoutBuilder::new().force()))?;
            Ok(())
        })
        .await
    }

    pub async fn commit_repository(&self, message: &str) -> Result<(), BootstrapError> {
        let message = message.to_string();
        self.with_lock(move |repo| {
            let mut index = repo.index()?;
            index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
            index.write()?;
            let tree_oid = index.write_tree()?;
            let tree = repo.find_tree(tree_oid)?;
            let sig = repo.signature().unwrap_or_else(|_| {
                git2::Signature::now("pvc-bootstrapd", "pvc-bootstrapd@localhost")
                    .expect("static signature is always valid")
            });
            let parent = repo.head()?.peel_to_commit()?;
            repo.commit(
                Some("HEAD"),
                &sig,
                &sig,
                &message,
                &tree,
                &[&parent],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn push_repository(&self) -> Result<(), BootstrapError> {
        self.with_lock(|repo| {
            let branch = repo_branch_name(repo)?;
            let mut remote = repo.find_remote("origin")?;
            let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
            remote.push(&[&refspec], None)?;
            Ok(())
        })
        .await
    }

    /// Serializes `f` against both the in-process mutex and the on-disk
    /// `fd-lock`, matching `original_source/lib/git.py`'s
    /// `FileLock(config['ansible_lock_file'])` guard around pull/commit/push.
    async fn with_lock<F>(&self, f: F) -> Result<(), BootstrapError>
    where
        F: FnOnce(&git2::Repository) -> Result<(), git2::Error> + Send + 'static,
    {
        let _guard = self.mutate_guard.lock().await;
        let repo_path = self.repo_path.clone();
        let lock_path = self.lock_path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), BootstrapError> {
            let lock_file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .open(&lock_path)?;
            let mut lock = FdRwLock::new(lock_file);
            let _write_guard = lock
                .write()
                .map_err(|e| BootstrapError::Spec(format!("failed to acquire git lock: {e}")))?;
            let repo = git2::Repository::open(&repo_path)?;
            f(&repo)?;
            Ok(())
        })
        .await
        .expect("spawn_blocking join")
    }

    /// Reads `clusters.yml` then, per cluster, the three cspec YAML
    /// documents, merging them into a `CSpec`. A per-cluster parse failure
    /// is logged and that cluster is skipped; MAC keys are lowercased.
    pub async fn load_cspec(&self) -> Result<CSpec, BootstrapError> {
        let repo_path = self.repo_path.clone();
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || load_cspec_blocking(&repo_path, &config))
            .await
            .expect("spawn_blocking join")
    }
}

fn repo_branch_name(repo: &git2::Repository) -> Result<String, git2::Error> {
    let head = repo.head()?;
    Ok(head
        .shorthand()
        .ok_or_else(|| git2::Error::from_str("HEAD has no shorthand name"))?
        .to_string())
}

fn load_cspec_blocking(
    repo_path: &Path,
    config: &AnsibleConfig,
) -> Result<CSpec, BootstrapError> {
    let clusters_path = repo_path.join(&config.clusters_file);
    let clusters_yaml: ClustersYaml = serde_yaml::from_str(
        &std::fs::read_to_string(&clusters_path)
            .map_err(|e| BootstrapError::Spec(format!("reading {clusters_path:?}: {e}")))?,
    )
    .map_err(|e| BootstrapError::Spec(format!("parsing {clusters_path:?}: {e}")))?;

    let mut cspec = CSpec::default();

    for cluster_name in clusters_yaml.clusters {
        match load_one_cluster(repo_path, config, &cluster_name) {
            Ok((bootstrap, hooks, node_names, pvc_yaml)) => {
                cspec.bootstrap.extend(bootstrap);
                cspec.hooks.insert(cluster_name.clone(), hooks);
                cspec.bootstrap_nodes.insert(cluster_name.clone(), node_names);
                cspec.pvc.insert(cluster_name, pvc_yaml);
            }
            Err(e) => {
                warn!("skipping cluster '{}' due to spec error: {}", cluster_name, e);
            }
        }
    }

    Ok(cspec)
}

#[allow(clippy::type_complexity)]
fn load_one_cluster(
    repo_path: &Path,
    config: &AnsibleConfig,
    cluster_name: &str,
) -> Result<(HashMap<String, BootstrapEntry>, Vec<Hook>, Vec<String>, PvcYaml), BootstrapError> {
    let group_vars = repo_path.join("group_vars").join(cluster_name);

    let base: BaseYaml = read_yaml(&group_vars.join(&config.cspec_files.base))?;
    let pvc_yaml: PvcYaml = read_yaml(&group_vars.join(&config.cspec_files.pvc))?;

    #[derive(Deserialize)]
    struct BootstrapYaml {
        #[serde(default)]
        bootstrap: HashMap<String, RawBootstrapEntry>,
        #[serde(default)]
        hooks: Vec<Hook>,
    }
    #[derive(Deserialize)]
    struct RawBootstrapEntry {
        bmc: BmcEntry,
        node: RawNodeEntry,
    }
    #[derive(Deserialize)]
    struct RawNodeEntry {
        hostname: String,
        #[serde(default)]
        config: NodeConfig,
    }

    let bootstrap_yaml: BootstrapYaml =
        read_yaml(&group_vars.join(&config.cspec_files.bootstrap))?;

    let mut bootstrap = HashMap::new();
    let mut node_names = Vec::new();
    for (mac, entry) in bootstrap_yaml.bootstrap {
        let mac = mac.to_lowercase();
        let fqdn = format!("{}.{}", entry.node.hostname, base.local_domain);
        node_names.push(entry.node.hostname.clone());
        bootstrap.insert(
            mac,
            BootstrapEntry {
                bmc: entry.bmc,
                node: NodeEntry {
                    cluster: cluster_name.to_string(),
                    hostname: entry.node.hostname,
                    domain: base.local_domain.clone(),
                    fqdn,
                    config: entry.node.config,
                },
            },
        );
    }

    Ok((bootstrap, bootstrap_yaml.hooks, node_names, pvc_yaml))
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, BootstrapError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| BootstrapError::Spec(format!("reading {path:?}: {e}")))?;
    serde_yaml::from_str(&contents).map_err(|e| BootstrapError::Spec(format!("parsing {path:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bmc_mac_keys_are_lowercased_on_load() {
        let repo = tempfile::tempdir().unwrap();
        let group_vars = repo.path().join("group_vars").join("c1");
        std::fs::create_dir_all(&group_vars).unwrap();
        std::fs::write(
            group_vars.join("base.yml"),
            "local_domain: bootstrap.local\n",
        )
        .unwrap();
        std::fs::write(
            group_vars.join("bootstrap.yml"),
            r#"
bootstrap:
  "AA:BB:CC:DD:EE:FF":
    bmc:
      username: admin
      password: secret
    node:
      hostname: n1
hooks: []
"#,
        )
        .unwrap();
        std::fs::write(
            group_vars.join("pvc.yml"),
            "storage_pool: rbd\n",
        )
        .unwrap();

        let config = AnsibleConfig {
            path: repo.path().to_str().unwrap().to_string(),
            keyfile: "/tmp/key".to_string(),
            remote: "unused".to_string(),
            branch: "main".to_string(),
            clusters_file: "clusters.yml".to_string(),
            cspec_files: crate::config::CspecFilesConfig {
                base: "base.yml".to_string(),
                pvc: "pvc.yml".to_string(),
                bootstrap: "bootstrap.yml".to_string(),
            },
            deploy_username_ssh: "deploy".to_string(),
        };

        let (bootstrap, _hooks, node_names, pvc_yaml) =
            load_one_cluster(repo.path(), &config, "c1").unwrap();
        assert!(bootstrap.contains_key("aa:bb:cc:dd:ee:ff"));
        assert_eq!(node_names, vec!["n1".to_string()]);
        assert_eq!(
            bootstrap["aa:bb:cc:dd:ee:ff"].node.fqdn,
            "n1.bootstrap.local"
        );
        assert_eq!(
            pvc_yaml.0.get("storage_pool").and_then(|v| v.as_str()),
            Some("rbd")
        );
    }
}
