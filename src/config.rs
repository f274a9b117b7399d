// src/config.rs

//! Loads and validates the daemon's YAML configuration file.
//!
//! Unlike a typical `#[serde(default)]`-per-field config, every key under
//! `pvc` is required: a missing top-level, first-level, or second-level key
//! MUST fail startup naming the exact missing path, so loading goes through
//! an untyped `serde_yaml::Value` walk before the typed deserialization.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub address: String,
    pub port: u16,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhcpConfig {
    pub address: String,
    pub gateway: String,
    pub domain: String,
    pub lease_start: String,
    pub lease_end: String,
    pub lease_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TftpConfig {
    pub root_path: String,
    pub host_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CspecFilesConfig {
    pub base: String,
    pub pvc: String,
    pub bootstrap: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnsibleConfig {
    pub path: String,
    pub keyfile: String,
    pub remote: String,
    pub branch: String,
    pub clusters_file: String,
    pub cspec_files: CspecFilesConfig,
    /// The deploy user the HookRunner authenticates as over SSH; reuses the
    /// same key file as the configuration runner.
    #[serde(default = "default_deploy_username")]
    pub deploy_username_ssh: String,
}

fn default_deploy_username() -> String {
    "deploy".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsConfig {
    pub enabled: bool,
    pub uri: String,
    pub action: String,
    pub icons: std::collections::HashMap<String, String>,
    pub body: String,
    pub completed_triggerword: String,
}

/// The package-mirror URL substituted into rendered preseed files.
/// Silence in the distilled spec on this key is resolved in favor of the
/// original implementation's top-level `repo_mirror`, renamed to fit the
/// nested `pvc.*` convention (see DESIGN.md Open Question 7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PvcConfig {
    pub debug: bool,
    pub deploy_username: String,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub queue: QueueConfig,
    pub dhcp: DhcpConfig,
    pub tftp: TftpConfig,
    pub ansible: AnsibleConfig,
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub mirror: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub pvc: PvcConfig,
}

/// The paths, in order, that a valid config must contain at minimum.
/// Walked against the raw YAML before typed deserialization so a missing
/// key is reported by its dotted path rather than a generic serde error.
const REQUIRED_PATHS: &[&str] = &[
    "pvc",
    "pvc.debug",
    "pvc.deploy_username",
    "pvc.database",
    "pvc.database.path",
    "pvc.api",
    "pvc.api.address",
    "pvc.api.port",
    "pvc.queue",
    "pvc.queue.address",
    "pvc.queue.port",
    "pvc.queue.path",
    "pvc.dhcp",
    "pvc.dhcp.address",
    "pvc.dhcp.gateway",
    "pvc.dhcp.domain",
    "pvc.dhcp.lease_start",
    "pvc.dhcp.lease_end",
    "pvc.dhcp.lease_time",
    "pvc.tftp",
    "pvc.tftp.root_path",
    "pvc.tftp.host_path",
    "pvc.ansible",
    "pvc.ansible.path",
    "pvc.ansible.keyfile",
    "pvc.ansible.remote",
    "pvc.ansible.branch",
    "pvc.ansible.clusters_file",
    "pvc.ansible.cspec_files",
    "pvc.ansible.cspec_files.base",
    "pvc.ansible.cspec_files.pvc",
    "pvc.ansible.cspec_files.bootstrap",
    "pvc.notifications",
    "pvc.notifications.enabled",
    "pvc.notifications.uri",
    "pvc.notifications.action",
    "pvc.notifications.icons",
    "pvc.notifications.body",
    "pvc.notifications.completed_triggerword",
];

fn walk<'a>(root: &'a serde_yaml::Value, path: &str) -> Option<&'a serde_yaml::Value> {
    let mut cur = root;
    for segment in path.split('.').skip(1) {
        cur = cur.get(segment)?;
    }
    Some(cur)
}

impl Config {
    /// Loads and validates the configuration file at `path`.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;

        let raw: serde_yaml::Value =
            serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_string(),
                source,
            })?;

        for required in REQUIRED_PATHS {
            if walk(&raw, required).is_none() {
                return Err(ConfigError::MissingKey {
                    path: (*required).to_string(),
                });
            }
        }

        let config: Config =
            serde_yaml::from_value(raw).map_err(|source| ConfigError::Parse {
                path: path.to_string(),
                source,
            })?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.pvc.api.port == 0 {
            return Err(ConfigError::InvalidValue {
                path: "pvc.api.port".to_string(),
                reason: "cannot be 0".to_string(),
            });
        }
        if self.pvc.queue.port == 0 {
            return Err(ConfigError::InvalidValue {
                path: "pvc.queue.port".to_string(),
                reason: "cannot be 0".to_string(),
            });
        }
        if !Path::new(&self.pvc.ansible.keyfile).is_absolute() {
            return Err(ConfigError::InvalidValue {
                path: "pvc.ansible.keyfile".to_string(),
                reason: "must be an absolute path".to_string(),
            });
        }
        Ok(())
    }
}

/// Logs the parts of the configuration an operator would want to see at a
/// glance on every startup.
pub fn log_startup_info(config: &Config) {
    info!(
        "database path: {}, api: {}:{}, dhcp range: {}-{}",
        config.pvc.database.path,
        config.pvc.api.address,
        config.pvc.api.port,
        config.pvc.dhcp.lease_start,
        config.pvc.dhcp.lease_end,
    );
    if config.pvc.debug {
        info!("debug mode enabled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> String {
        r#"
pvc:
  debug: false
  deploy_username: deploy
  database:
    path: /var/lib/pvcbootstrapd/pvc.db
  api:
    address: 0.0.0.0
    port: 8080
  queue:
    address: 127.0.0.1
    port: 8081
    path: /var/lib/pvcbootstrapd/queue
  dhcp:
    address: 10.0.0.1
    gateway: 10.0.0.1
    domain: bootstrap.local
    lease_start: 10.0.0.100
    lease_end: 10.0.0.200
    lease_time: 1h
  tftp:
    root_path: /tftp
    host_path: /tftp/hosts
  ansible:
    path: /srv/ansible
    keyfile: /etc/pvcbootstrapd/deploy.key
    remote: git@example.com:pvc/spec.git
    branch: main
    clusters_file: clusters.yml
    cspec_files:
      base: base.yml
      pvc: pvc.yml
      bootstrap: bootstrap.yml
  notifications:
    enabled: false
    uri: https://example.com/hook
    action: post
    icons: {}
    body: "{message}"
    completed_triggerword: completed
"#
        .to_string()
    }

    #[test]
    fn loads_minimal_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, minimal_yaml()).unwrap();
        let config = Config::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.pvc.api.port, 8080);
        assert_eq!(config.pvc.database.path, "/var/lib/pvcbootstrapd/pvc.db");
    }

    #[test]
    fn missing_nested_key_is_named_precisely() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        let yaml = minimal_yaml().replace("    port: 8080\n", "");
        std::fs::write(&path, yaml).unwrap();
        let err = Config::from_file(path.to_str().unwrap()).unwrap_err();
        match err {
            ConfigError::MissingKey { path } => assert_eq!(path, "pvc.api.port"),
            other => panic!("expected MissingKey, got {other:?}"),
        }
    }

    #[test]
    fn rejects_relative_keyfile_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        let yaml = minimal_yaml().replace(
            "keyfile: /etc/pvcbootstrapd/deploy.key",
            "keyfile: deploy.key",
        );
        std::fs::write(&path, yaml).unwrap();
        let err = Config::from_file(path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
