// src/hooks.rs

//! Post-install hook execution: SSH/SFTP actions run against a cluster's
//! nodes once every node has reached `booted-configured`. Grounded on
//! `original_source/lib/hooks.py`.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::time::Duration;

use serde_json::{Map, Value};
use ssh2::Session as SshSession;
use tracing::{info, warn};

use crate::config::AnsibleConfig;
use crate::error::BootstrapError;
use crate::notify::{Notifier, Severity};
use crate::specloader::{Hook, HookTarget};
use crate::store::{Cluster, Node, Store};

pub struct HookRunner {
    config: AnsibleConfig,
}

impl HookRunner {
    pub fn new(config: AnsibleConfig) -> Self {
        Self { config }
    }

    /// Runs every hook configured for `cluster`, in order, after a 300s
    /// settle delay. Each hook's failure is isolated: it is logged and
    /// notified, and the loop continues to the next hook.
    pub async fn run_cluster_hooks(
        &self,
        store: &Store,
        notifier: &Notifier,
        cluster: &Cluster,
        hooks: &[Hook],
    ) -> Result<(), BootstrapError> {
        info!("waiting 300s before starting hook run for cluster {}", cluster.name);
        tokio::time::sleep(Duration::from_secs(300)).await;
        notifier
            .send(
                Severity::Begin,
                &format!("Cluster {}: running post-setup hook tasks", cluster.name),
            )
            .await;

        let nodes = store.list_nodes(cluster.id).await?;

        for hook in hooks {
            let targets = select_targets(&nodes, &hook.target);
            let Some(hook_type) = hook.hook_type.as_deref() else {
                warn!("hook '{}' is missing a type, skipping", hook.name);
                continue;
            };

            notifier
                .send(
                    Severity::Begin,
                    &format!("Cluster {}: running hook task '{}'", cluster.name, hook.name),
                )
                .await;

            match self.dispatch(hook_type, &targets, &hook.args).await {
                Ok(()) => {
                    notifier
                        .send(
                            Severity::Success,
                            &format!("Cluster {}: completed hook task '{}'", cluster.name, hook.name),
                        )
                        .await;
                }
                Err(e) => {
                    warn!("hook '{}' failed: {}", hook.name, e);
                    notifier
                        .send(
                            Severity::Failure,
                            &format!(
                                "Cluster {}: hook task '{}' failed: {}",
                                cluster.name, hook.name, e
                            ),
                        )
                        .await;
                }
            }

            tokio::time::sleep(Duration::from_secs(5)).await;
        }

        notifier
            .send(
                Severity::Success,
                &format!("Cluster {}: completed post-setup hook tasks", cluster.name),
            )
            .await;
        Ok(())
    }

    async fn dispatch(
        &self,
        hook_type: &str,
        targets: &[Node],
        args: &Map<String, Value>,
    ) -> Result<(), BootstrapError> {
        match hook_type {
            "osddb" => self.run_osddb(targets, args).await,
            "osd" => self.run_osd(targets, args).await,
            "pool" => self.run_pool(targets, args).await,
            "network" => self.run_network(targets, args).await,
            "copy" => self.run_copy(targets, args).await,
            "script" => self.run_script(targets, args).await,
            "webhook" => self.run_webhook(args).await,
            other => Err(BootstrapError::Hook(format!("unknown hook type '{other}'"))),
        }
    }

    async fn run_osddb(&self, targets: &[Node], args: &Map<String, Value>) -> Result<(), BootstrapError> {
        let device = require_str(args, "disk")?;
        for node in targets {
            let command = format!("pvc storage osd create-db-vg --yes {} {}", node.name, device);
            self.exec_on(node, &command).await?;
        }
        Ok(())
    }

    async fn run_osd(&self, targets: &[Node], args: &Map<String, Value>) -> Result<(), BootstrapError> {
        let device = require_str(args, "disk")?;
        let weight = args.get("weight").and_then(|v| v.as_i64()).unwrap_or(1);
        let ext_db = args.get("ext_db").and_then(|v| v.as_bool()).unwrap_or(false);
        let ext_db_ratio = args.get("ext_db_ratio").and_then(|v| v.as_f64()).unwrap_or(0.05);

        let mut command = format!(
            "pvc storage osd add --yes {{node}} {device} --weight {weight}"
        );
        if ext_db {
            command.push_str(&format!(" --ext-db --ext-db-ratio {ext_db_ratio}"));
        }

        for node in targets {
            let command = command.replace("{node}", &node.name);
            self.exec_on(node, &command).await?;
        }
        Ok(())
    }

    /// Runs only once, against the first target node.
    async fn run_pool(&self, targets: &[Node], args: &Map<String, Value>) -> Result<(), BootstrapError> {
        let Some(node) = targets.first() else {
            return Ok(());
        };
        let name = require_str(args, "name")?;
        let pgs = args.get("pgs").and_then(|v| v.as_str()).unwrap_or("64");
        let replcfg = args
            .get("replcfg")
            .and_then(|v| v.as_str())
            .unwrap_or("copies=3,mincopies=2");

        let command = format!("pvc storage pool add {name} {pgs} --replcfg {replcfg}");
        self.exec_on(node, &command).await
    }

    /// Runs only once, against the first target node.
    async fn run_network(&self, targets: &[Node], args: &Map<String, Value>) -> Result<(), BootstrapError> {
        let Some(node) = targets.first() else {
            return Ok(());
        };
        let command = build_network_command(args)?;
        self.exec_on(node, &command)
            .await
    }

    async fn run_copy(&self, targets: &[Node], args: &Map<String, Value>) -> Result<(), BootstrapError> {
        let sources = string_array(args, "source");
        let destinations = string_array(args, "destination");
        let modes = string_array(args, "mode");

        for node in targets {
            let Some(host) = node.host_ipaddr.as_deref() else {
                warn!("node {} has no host address, skipping copy hook", node.name);
                continue;
            };
            info!("copying {} files to node {}", sources.len(), node.name);
            for ((sfile, dfile), dmode) in sources.iter().zip(&destinations).zip(&modes) {
                let local_path = resolve_local_path(&self.config.path, sfile);
                let mode = u32::from_str_radix(dmode, 8).unwrap_or(0o644);
                self.sftp_put(host, &local_path, dfile, mode).await?;
            }
        }
        Ok(())
    }

    async fn run_script(&self, targets: &[Node], args: &Map<String, Value>) -> Result<(), BootstrapError> {
        let script = args.get("script").and_then(|v| v.as_str());
        let source = args.get("source").and_then(|v| v.as_str());
        let path = args.get("path").and_then(|v| v.as_str());
        let arguments: Vec<String> = args
            .get("arguments")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str()).map(String::from).collect())
            .unwrap_or_default();
        let use_sudo = args.get("use_sudo").and_then(|v| v.as_bool()).unwrap_or(false);

        const REMOTE_PATH: &str = "/tmp/pvcbootstrapd.hook";

        for node in targets {
            let Some(host) = node.host_ipaddr.as_deref() else {
                warn!("node {} has no host address, skipping script hook", node.name);
                continue;
            };

            match (script, source) {
                (Some(inline), _) => {
                    self.sftp_put_contents(host, inline, REMOTE_PATH, 0o755).await?;
                }
                (None, Some("local")) => {
                    let Some(path) = path else { continue };
                    let local_path = resolve_local_path(&self.config.path, path);
                    self.sftp_put(host, &local_path, REMOTE_PATH, 0o755).await?;
                }
                (None, Some("remote")) => {
                    // Already present on the target; nothing to upload.
                }
                _ => continue,
            };

            let remote_path = if source == Some("remote") {
                path.unwrap_or(REMOTE_PATH)
            } else {
                REMOTE_PATH
            };
            let command = build_remote_command(remote_path, &arguments, use_sudo);
            self.exec_on(node, &command).await?;
        }
        Ok(())
    }

    async fn run_webhook(&self, args: &Map<String, Value>) -> Result<(), BootstrapError> {
        let uri = require_str(args, "uri")?.to_string();
        let action = require_str(args, "action")?.to_string();
        let body = args
            .get("body")
            .cloned()
            .unwrap_or(Value::Object(Map::new()));

        info!("running webhook hook against {}", uri);
        let client = reqwest::Client::new();
        let request = match action.to_lowercase().as_str() {
            "get" => client.get(uri.as_str()),
            "put" => client.put(uri.as_str()),
            "patch" => client.patch(uri.as_str()),
            "delete" => client.delete(uri.as_str()),
            "options" => client.request(reqwest::Method::OPTIONS, uri.as_str()),
            _ => client.post(uri.as_str()),
        };
        request.json(&body).send().await?;
        Ok(())
    }

    async fn exec_on(&self, node: &Node, command: &str) -> Result<(), BootstrapError> {
        let Some(host) = node.host_ipaddr.clone() else {
            return Err(BootstrapError::Hook(format!(
                "node {} has no host address",
                node.name
            )));
        };
        let config = self.config.clone();
        let command = command.to_string();
        tokio::task::spawn_blocking(move || ssh_exec(&config, &host, &command))
            .await
            .expect("spawn_blocking join")
    }

    async fn sftp_put(&self, host: &str, local_path: &str, remote_path: &str, mode: u32) -> Result<(), BootstrapError> {
        let contents = tokio::fs::read(local_path).await?;
        let config = self.config.clone();
        let host = host.to_string();
        let remote_path = remote_path.to_string();
        tokio::task::spawn_blocking(move || ssh_sftp_put(&config, &host, &contents, &remote_path, mode))
            .await
            .expect("spawn_blocking join")
    }

    async fn sftp_put_contents(&self, host: &str, contents: &str, remote_path: &str, mode: u32) -> Result<(), BootstrapError> {
        let config = self.config.clone();
        let host = host.to_string();
        let remote_path = remote_path.to_string();
        let contents = contents.as_bytes().to_vec();
        tokio::task::spawn_blocking(move || ssh_sftp_put(&config, &host, &contents, &remote_path, mode))
            .await
            .expect("spawn_blocking join")
    }
}

fn select_targets(nodes: &[Node], target: &HookTarget) -> Vec<Node> {
    match target {
        HookTarget::All(_) => nodes.to_vec(),
        HookTarget::Nodes(names) => nodes
            .iter()
            .filter(|n| names.contains(&n.name))
            .cloned()
            .collect(),
    }
}

fn require_str<'a>(args: &'a Map<String, Value>, key: &str) -> Result<&'a str, BootstrapError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| BootstrapError::Hook(format!("hook args missing required key '{key}'")))
}

fn string_array(args: &Map<String, Value>, key: &str) -> Vec<String> {
    args.get(key)
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|v| v.as_str()).map(String::from).collect())
        .unwrap_or_default()
}

/// Non-absolute source paths are resolved relative to the spec
/// repository checkout, matching `config['ansible_path']` prefixing in
/// the original hook runner.
fn resolve_local_path(ansible_path: &str, source: &str) -> String {
    if source.starts_with('/') {
        source.to_string()
    } else {
        format!("{ansible_path}/{source}")
    }
}

fn build_remote_command(remote_path: &str, arguments: &[String], use_sudo: bool) -> String {
    let mut command = if arguments.is_empty() {
        remote_path.to_string()
    } else {
        format!("{remote_path} {}", arguments.join(" "))
    };
    if use_sudo {
        command = format!("sudo {command}");
    }
    command
}

fn build_network_command(args: &Map<String, Value>) -> Result<String, BootstrapError> {
    let vni = require_str(args, "vni")?;
    let description = require_str(args, "description")?;
    let nettype = require_str(args, "type")?;
    let mtu = args.get("mtu").and_then(|v| v.as_str());

    let mut command = format!("pvc network add {vni} --description {description} --type {nettype}");

    if let Some(mtu) = mtu
        && mtu != "auto"
        && mtu != "default"
    {
        command.push_str(&format!(" --mtu {mtu}"));
    }

    if nettype == "managed" {
        let domain = require_str(args, "domain")?;
        command.push_str(&format!(" --domain {domain}"));

        for dns_server in string_array(args, "dns_servers") {
            command.push_str(&format!(" --dns-server {dns_server}"));
        }

        if args.get("ip4").and_then(|v| v.as_bool()).unwrap_or(false) {
            let ip4_network = require_str(args, "ip4_network")?;
            let ip4_gateway = require_str(args, "ip4_gateway")?;
            command.push_str(&format!(" --ipnet {ip4_network} --gateway {ip4_gateway}"));

            if args.get("ip4_dhcp").and_then(|v| v.as_bool()).unwrap_or(false) {
                let dhcp_start = require_str(args, "ip4_dhcp_start")?;
                let dhcp_end = require_str(args, "ip4_dhcp_end")?;
                command.push_str(&format!(" --dhcp --dhcp-start {dhcp_start} --dhcp-end {dhcp_end}"));
            } else {
                command.push_str(" --no-dhcp");
            }
        }

        if args.get("ip6").and_then(|v| v.as_bool()).unwrap_or(false) {
            let ip6_network = require_str(args, "ip6_network")?;
            let ip6_gateway = require_str(args, "ip6_gateway")?;
            command.push_str(&format!(" --ipnet6 {ip6_network} --gateway6 {ip6_gateway}"));
        }
    }

    Ok(command)
}

fn ssh_exec(config: &AnsibleConfig, host: &str, command: &str) -> Result<(), BootstrapError> {
    let session = ssh_connect(config, host)?;
    let mut channel = session.channel_session()?;
    channel.exec(command)?;
    let mut stdout = String::new();
    channel.read_to_string(&mut stdout)?;
    let mut stderr = String::new();
    channel.stderr().read_to_string(&mut stderr)?;
    channel.wait_close()?;
    if !stdout.is_empty() {
        tracing::debug!("{}", stdout.trim_end());
    }
    if !stderr.is_empty() {
        tracing::debug!("{}", stderr.trim_end());
    }
    Ok(())
}

fn ssh_sftp_put(
    config: &AnsibleConfig,
    host: &str,
    contents: &[u8],
    remote_path: &str,
    mode: u32,
) -> Result<(), BootstrapError> {
    let session = ssh_connect(config, host)?;
    let sftp = session.sftp()?;
    let mut file = sftp.create(Path::new(remote_path))?;
    file.write_all(contents)?;
    drop(file);
    sftp.setstat(
        Path::new(remote_path),
        ssh2::FileStat {
            size: None,
            uid: None,
            gid: None,
            perm: Some(mode),
            atime: None,
            mtime: None,
        },
    )?;
    Ok(())
}

fn ssh_connect(config: &AnsibleConfig, host: &str) -> Result<SshSession, BootstrapError> {
    let tcp = TcpStream::connect((host, 22))?;
    let mut session = SshSession::new()?;
    session.set_tcp_stream(tcp);
    session.handshake()?;
    session.userauth_pubkey_file(
        &config.deploy_username_ssh,
        None,
        Path::new(&config.keyfile),
        None,
    )?;
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_local_path_prefixes_relative_sources() {
        assert_eq!(
            resolve_local_path("/srv/cspec", "files/motd"),
            "/srv/cspec/files/motd"
        );
        assert_eq!(resolve_local_path("/srv/cspec", "/etc/motd"), "/etc/motd");
    }

    #[test]
    fn build_remote_command_applies_arguments_and_sudo() {
        let args = vec!["--force".to_string()];
        assert_eq!(
            build_remote_command("/tmp/hook", &args, true),
            "sudo /tmp/hook --force"
        );
        assert_eq!(build_remote_command("/tmp/hook", &[], false), "/tmp/hook");
    }

    #[test]
    fn build_network_command_includes_managed_options() {
        let mut args = Map::new();
        args.insert("vni".to_string(), Value::String("100".to_string()));
        args.insert("description".to_string(), Value::String("storage".to_string()));
        args.insert("type".to_string(), Value::String("managed".to_string()));
        args.insert("domain".to_string(), Value::String("pvc.local".to_string()));

        let command = build_network_command(&args).unwrap();
        assert!(command.contains("pvc network add 100"));
        assert!(command.contains("--domain pvc.local"));
    }

    #[test]
    fn build_network_command_skips_mtu_when_auto() {
        let mut args = Map::new();
        args.insert("vni".to_string(), Value::String("100".to_string()));
        args.insert("description".to_string(), Value::String("d".to_string()));
        args.insert("type".to_string(), Value::String("bridged".to_string()));
        args.insert("mtu".to_string(), Value::String("auto".to_string()));

        let command = build_network_command(&args).unwrap();
        assert!(!command.contains("--mtu"));
    }

    #[test]
    fn select_targets_all_returns_every_node() {
        let nodes = vec![
            Node {
                id: 1,
                cluster_id: 1,
                name: "n1".to_string(),
                nid: 1,
                state: crate::store::NodeState::Completed,
                bmc_macaddr: None,
                bmc_ipaddr: None,
                host_macaddr: None,
                host_ipaddr: Some("10.0.0.1".to_string()),
            },
            Node {
                id: 2,
                cluster_id: 1,
                name: "n2".to_string(),
                nid: 2,
                state: crate::store::NodeState::Completed,
                bmc_macaddr: None,
                bmc_ipaddr: None,
                host_macaddr: None,
                host_ipaddr: Some("10.0.0.2".to_string()),
            },
        ];
        let all = select_targets(&nodes, &HookTarget::All("all".to_string()));
        assert_eq!(all.len(), 2);

        let one = select_targets(&nodes, &HookTarget::Nodes(vec!["n2".to_string()]));
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].name, "n2");
    }
}
