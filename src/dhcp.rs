// src/dhcp.rs

//! Supervises the DHCP/TFTP subprocess (`dnsmasq`). Grounded on
//! `original_source/lib/dnsmasq.py`'s argv construction and
//! `original_source/Daemon.py`'s signal-forwarding shutdown sequence.

use std::process::Stdio;

use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::config::{DhcpConfig, TftpConfig};
use crate::error::BootstrapError;

pub struct DhcpDriver {
    dhcp: DhcpConfig,
    tftp: TftpConfig,
    api_port: u16,
    dnsmasq_bin: String,
}

impl DhcpDriver {
    pub fn new(dhcp: DhcpConfig, tftp: TftpConfig, api_port: u16) -> Self {
        Self {
            dhcp,
            tftp,
            api_port,
            dnsmasq_bin: "/usr/sbin/dnsmasq".to_string(),
        }
    }

    /// The daemon's command line is computed once from configuration and is
    /// stable across restarts, matching `DNSMasq.__init__`'s argv list.
    fn build_args(&self) -> Vec<String> {
        vec![
            "--no-daemon".to_string(),
            "--bogus-priv".to_string(),
            "--no-hosts".to_string(),
            "--dhcp-authoritative".to_string(),
            "--filterwin2k".to_string(),
            "--expand-hosts".to_string(),
            "--domain-needed".to_string(),
            format!("--domain={}", self.dhcp.domain),
            format!("--listen-address={}", self.dhcp.address),
            format!(
                "--dhcp-range={},{},{}",
                self.dhcp.lease_start, self.dhcp.lease_end, self.dhcp.lease_time
            ),
            format!("--dhcp-option=option:router,{}", self.dhcp.gateway),
            "--enable-tftp".to_string(),
            format!("--tftp-root={}", self.tftp.root_path),
            // iPXE chainload tag-if rule: machines that already identify as
            // iPXE get the per-MAC config; everything else gets the
            // bootstrap iPXE binary first.
            "--dhcp-match=set:ipxe,175".to_string(),
            "--dhcp-boot=tag:!ipxe,undionly.kpxe".to_string(),
            "--dhcp-boot=tag:ipxe,mac-${net0/mac}.ipxe".to_string(),
            "--dhcp-script".to_string(),
            self.lease_script_command(),
        ]
    }

    fn lease_script_command(&self) -> String {
        format!(
            "dnsmasq-lease --api-address {} --api-port {}",
            self.dhcp.address, self.api_port
        )
    }

    fn spawn_child(&self) -> std::io::Result<Child> {
        Command::new(&self.dnsmasq_bin)
            .args(self.build_args())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
    }

    /// Runs the supervised child until shutdown is requested or the child
    /// exits on its own. A self-exit is treated as fatal: per spec.md §4.4
    /// "the controller is useless without DHCP", so this returns an error
    /// rather than attempting a partial restart.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<(), BootstrapError> {
        let mut child = self.spawn_child().map_err(BootstrapError::Io)?;
        info!("dnsmasq started (pid {:?})", child.id());

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(BootstrapError::Io)?;
                error!("dnsmasq exited unexpectedly with status {}", status);
                Err(BootstrapError::Runner(format!(
                    "dnsmasq child exited with status {status}; DHCP/TFTP is unavailable"
                )))
            }
            _ = shutdown_rx.recv() => {
                info!("shutdown requested, forwarding SIGTERM to dnsmasq");
                if let Some(pid) = child.id() {
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGTERM);
                    }
                }
                match child.wait().await {
                    Ok(status) => info!("dnsmasq exited after SIGTERM: {}", status),
                    Err(e) => warn!("error waiting for dnsmasq after SIGTERM: {}", e),
                }
                Ok(())
            }
        }
    }
}
