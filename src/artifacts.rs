// src/artifacts.rs

//! Renders per-MAC PXE chainload and preseed files into the TFTP host
//! directory. Grounded on `original_source/lib/installer.py`, with one
//! deliberate correction: writes are atomic (temp file + rename) rather
//! than direct, per DESIGN.md's resolution of the atomic-write requirement
//! (spec.md §4.3 / P7).

use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::PvcConfig;
use crate::error::BootstrapError;
use crate::specloader::NodeEntry;

pub struct ArtifactRenderer {
    tftp_host_path: PathBuf,
    api_address: String,
    api_port: u16,
    mirror: Option<String>,
}

impl ArtifactRenderer {
    pub fn new(config: &PvcConfig) -> Self {
        Self {
            tftp_host_path: PathBuf::from(&config.tftp.host_path),
            api_address: config.dhcp.address.clone(),
            api_port: config.api.port,
            mirror: config.mirror.clone(),
        }
    }

    fn mac_path(&self, host_macaddr: &str, ext: &str) -> PathBuf {
        let stripped = host_macaddr.replace(':', "").to_lowercase();
        self.tftp_host_path.join(format!("mac-{stripped}.{ext}"))
    }

    /// Renders `mac-<mac>.ipxe`. Substitutes the space-joined
    /// `kernel_options`, if any.
    pub async fn render_pxe(&self, node: &NodeEntry, host_macaddr: &str) -> Result<(), BootstrapError> {
        let imgargs = node
            .config
            .kernel_options
            .as_ref()
            .map(|opts| opts.join(" "))
            .unwrap_or_default();

        let rendered = format!(
            "#!ipxe\nkernel vmlinuz initrd=initrd.img {imgargs}\ninitrd initrd.img\nboot\n"
        );

        render_atomic(&self.mac_path(host_macaddr, "ipxe"), &rendered).await
    }

    /// Renders `mac-<mac>.preseed`. Substitutes release, mirror, package
    /// list (comma-joined), filesystem, target disk, FQDN, and the in-band
    /// check-in URL.
    pub async fn render_preseed(
        &self,
        node: &NodeEntry,
        host_macaddr: &str,
        system_drive_target: &str,
    ) -> Result<(), BootstrapError> {
        let packages = node
            .config
            .packages
            .as_ref()
            .map(|pkgs| pkgs.join(","))
            .unwrap_or_default();
        let release = node.config.release.as_deref().unwrap_or("stable");
        let filesystem = node.config.filesystem.as_deref().unwrap_or("ext4");
        let mirror = self.mirror.as_deref().unwrap_or("");
        let checkin_uri = format!(
            "http://{}:{}/checkin/host",
            self.api_address, self.api_port
        );

        let rendered = format!(
            "d-i mirror/suite string {release}\n\
             d-i mirror/http/hostname string {mirror}\n\
             d-i pkgsel/include string {packages}\n\
             d-i partman-auto/init_automatically_partition select {filesystem}\n\
             d-i partman-auto/disk string {system_drive_target}\n\
             d-i netcfg/get_hostname string {hostname}\n\
             d-i netcfg/get_domain string {domain}\n\
             d-i preseed/late_command string in-target wget -O /dev/null \"{checkin_uri}\"\n",
            hostname = node.hostname,
            domain = node.domain,
        );

        info!(fqdn = %node.fqdn, "rendering preseed for {}", host_macaddr);
        render_atomic(&self.mac_path(host_macaddr, "preseed"), &rendered).await
    }
}

/// Writes `contents` to a temp file inside `path`'s parent directory then
/// renames it over `path`. POSIX rename within one filesystem is atomic,
/// so a concurrent PXE-booting host reading `path` always sees either the
/// previous complete file or the new complete one, never a partial write.
async fn render_atomic(path: &Path, contents: &str) -> Result<(), BootstrapError> {
    let parent = path
        .parent()
        .ok_or_else(|| BootstrapError::Runner(format!("{path:?} has no parent directory")))?;
    tokio::fs::create_dir_all(parent).await?;

    let tmp_path = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("artifact"),
        std::process::id()
    ));

    tokio::fs::write(&tmp_path, contents).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::specloader::NodeConfig;

    fn sample_node() -> NodeEntry {
        NodeEntry {
            cluster: "c1".to_string(),
            hostname: "n1".to_string(),
            domain: "bootstrap.local".to_string(),
            fqdn: "n1.bootstrap.local".to_string(),
            config: NodeConfig {
                release: Some("bookworm".to_string()),
                filesystem: Some("ext4".to_string()),
                packages: Some(vec!["pvc-daemon".to_string()]),
                kernel_options: Some(vec!["console=ttyS0".to_string()]),
                system_disks: vec![],
            },
        }
    }

    fn renderer(dir: &Path) -> ArtifactRenderer {
        ArtifactRenderer {
            tftp_host_path: dir.to_path_buf(),
            api_address: "10.0.0.1".to_string(),
            api_port: 8080,
            mirror: Some("deb.example.com".to_string()),
        }
    }

    #[tokio::test]
    async fn renders_both_files_with_stripped_mac() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = renderer(dir.path());
        let node = sample_node();

        renderer
            .render_pxe(&node, "AA:BB:CC:DD:EE:FF")
            .await
            .unwrap();
        renderer
            .render_preseed(&node, "AA:BB:CC:DD:EE:FF", "detect:intel:128GB:0")
            .await
            .unwrap();

        let ipxe = dir.path().join("mac-aabbccddeeff.ipxe");
        let preseed = dir.path().join("mac-aabbccddeeff.preseed");
        assert!(ipxe.exists());
        assert!(preseed.exists());

        let preseed_contents = tokio::fs::read_to_string(&preseed).await.unwrap();
        assert!(preseed_contents.contains("detect:intel:128GB:0"));
        assert!(preseed_contents.contains("n1.bootstrap.local") || preseed_contents.contains("n1"));
    }

    #[tokio::test]
    async fn no_leftover_temp_files_after_render() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = renderer(dir.path());
        renderer
            .render_pxe(&sample_node(), "AA:BB:CC:DD:EE:FF")
            .await
            .unwrap();
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = vec![];
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert!(names.iter().all(|n| !n.contains(".tmp-")));
    }
}
