// src/redfish/mod.rs

//! Redfish BMC orchestration: session handling, hardware characterization,
//! system-disk selection, and the bare-metal bring-up sequence. Grounded on
//! `original_source/lib/redfish.py`.

mod disk;
mod session;

pub use disk::{format_bytes_tohuman, get_system_drive_target};
pub use session::Session;

use std::time::Duration;

use serde_json::{Value, json};
use tracing::{info, warn};

use crate::artifacts::ArtifactRenderer;
use crate::error::BootstrapError;
use crate::notify::{Notifier, Severity};
use crate::specloader::BootstrapEntry;
use crate::store::{NodeState, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Vendor {
    Dell,
    Default,
}

impl Vendor {
    fn from_manufacturer(manufacturer: &str) -> Self {
        if manufacturer.to_lowercase().contains("dell") {
            Vendor::Dell
        } else {
            Vendor::Default
        }
    }
}

struct Characterization {
    vendor: Vendor,
    system_uri: String,
    manager_uri: String,
    bios_root: String,
    bios_attributes: Vec<String>,
    manager_attributes: Vec<String>,
}

/// Queries `https://<ip>/redfish/v1` up to 30 times, 10s apart, to decide
/// whether a freshly-discovered BMC speaks Redfish at all.
pub async fn check_redfish(ip: &str) -> bool {
    let client = match reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()
    {
        Ok(c) => c,
        Err(_) => return false,
    };
    let url = format!("https://{ip}/redfish/v1");

    for attempt in 1..=30 {
        match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => return true,
            _ => {
                if attempt == 30 {
                    warn!("redfish not reachable on {} after 300s", ip);
                }
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
        }
    }
    false
}

async fn set_indicator_state(
    session: &Session,
    system_uri: &str,
    vendor: Vendor,
    on: bool,
) -> Result<bool, BootstrapError> {
    let current = session
        .get(system_uri)
        .await?
        .and_then(|v| v.get("IndicatorLED").and_then(|v| v.as_str().map(String::from)));

    let target = match (vendor, on) {
        (Vendor::Dell, true) => "Blinking",
        (Vendor::Dell, false) => "Lit",
        (Vendor::Default, true) => "Lit",
        (Vendor::Default, false) => "Off",
    };

    if current.as_deref() == Some(target) {
        return Ok(false);
    }
    session
        .patch(system_uri, &json!({ "IndicatorLED": target }))
        .await?;
    Ok(true)
}

async fn set_power_state(
    session: &Session,
    system_uri: &str,
    on: bool,
) -> Result<bool, BootstrapError> {
    let current = session
        .get(system_uri)
        .await?
        .and_then(|v| v.get("PowerState").and_then(|v| v.as_str().map(String::from)));

    if (on && current.as_deref() == Some("On")) || (!on && current.as_deref() == Some("Off")) {
        return Ok(false);
    }

    let reset_type = if on { "On" } else { "ForceOff" };
    let action_uri = format!("{system_uri}/Actions/ComputerSystem.Reset");
    session
        .post(&action_uri, &json!({ "ResetType": reset_type }))
        .await?;
    Ok(true)
}

async fn set_boot_override_pxe(session: &Session, system_uri: &str) -> Result<(), BootstrapError> {
    session
        .patch(
            system_uri,
            &json!({
                "Boot": {
                    "BootSourceOverrideEnabled": "Once",
                    "BootSourceOverrideTarget": "Pxe",
                }
            }),
        )
        .await?;
    Ok(())
}

async fn wait_power_state(session: &Session, system_uri: &str, want: &str) -> Result<(), BootstrapError> {
    for _ in 0..120 {
        if let Some(system) = session.get(system_uri).await?
            && system.get("PowerState").and_then(|v| v.as_str()) == Some(want)
        {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
    Err(BootstrapError::Redfish(format!(
        "timed out waiting for PowerState={want}"
    )))
}

async fn characterize(session: &Session) -> Result<(Characterization, Value), BootstrapError> {
    let root = session
        .get("/redfish/v1")
        .await?
        .ok_or_else(|| BootstrapError::Redfish("service root missing".to_string()))?;

    let systems_uri = root
        .get("Systems")
        .and_then(|v| v.get("@odata.id"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| BootstrapError::Redfish("no Systems collection".to_string()))?;
    let systems = session
        .get(systems_uri)
        .await?
        .ok_or_else(|| BootstrapError::Redfish("Systems collection unreadable".to_string()))?;
    let system_uri = systems
        .get("Members")
        .and_then(|m| m.as_array())
        .and_then(|a| a.first())
        .and_then(|m| m.get("@odata.id"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| BootstrapError::Redfish("no Systems members".to_string()))?
        .to_string();
    let system = session
        .get(&system_uri)
        .await?
        .ok_or_else(|| BootstrapError::Redfish("system resource unreadable".to_string()))?;

    let manufacturer = system
        .get("Manufacturer")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    let vendor = Vendor::from_manufacturer(manufacturer);

    let bios_root = format!("{system_uri}/Bios");
    let bios = session.get(&bios_root).await?.unwrap_or(Value::Null);
    let bios_attributes: Vec<String> = bios
        .get("Attributes")
        .and_then(|v| v.as_object())
        .map(|m| m.keys().cloned().collect())
        .unwrap_or_default();

    let managers_uri = root
        .get("Managers")
        .and_then(|v| v.get("@odata.id"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| BootstrapError::Redfish("no Managers collection".to_string()))?;
    let managers = session
        .get(managers_uri)
        .await?
        .ok_or_else(|| BootstrapError::Redfish("Managers collection unreadable".to_string()))?;
    let manager_uri = managers
        .get("Members")
        .and_then(|m| m.as_array())
        .and_then(|a| a.first())
        .and_then(|m| m.get("@odata.id"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| BootstrapError::Redfish("no Managers members".to_string()))?
        .to_string();
    let manager = session
        .get(&manager_uri)
        .await?
        .unwrap_or(Value::Null);
    let manager_attributes: Vec<String> = manager
        .get("Oem")
        .and_then(|v| v.as_object())
        .and_then(|m| m.values().next())
        .and_then(|v| v.get("Attributes"))
        .and_then(|v| v.as_object())
        .map(|m| m.keys().cloned().collect())
        .unwrap_or_default();

    Ok((
        Characterization {
            vendor,
            system_uri,
            manager_uri,
            bios_root,
            bios_attributes,
            manager_attributes,
        },
        system,
    ))
}

/// Resolves the bootstrap MAC: prefers an embedded NIC (an
/// `EthernetInterfaces` entry whose `@odata.id` contains "Embedded",
/// lowest id first), falling back to `HostCorrelation.HostMACAddress[0]`.
async fn resolve_host_macaddr(
    session: &Session,
    system: &Value,
) -> Result<Option<String>, BootstrapError> {
    if let Some(eth_uri) = system
        .get("EthernetInterfaces")
        .and_then(|v| v.get("@odata.id"))
        .and_then(|v| v.as_str())
        && let Some(collection) = session.get(eth_uri).await?
    {
        let mut members: Vec<String> = collection
            .get("Members")
            .and_then(|m| m.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|m| m.get("@odata.id").and_then(|v| v.as_str()))
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default();
        members.sort();
        for member_uri in members.iter().filter(|u| u.contains("Embedded")) {
            if let Some(nic) = session.get(member_uri).await?
                && let Some(mac) = nic.get("MACAddress").and_then(|v| v.as_str())
            {
                return Ok(Some(mac.to_lowercase()));
            }
        }
    }

    if let Some(mac) = system
        .get("HostCorrelation")
        .and_then(|v| v.get("HostMACAddress"))
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .and_then(|v| v.as_str())
    {
        return Ok(Some(mac.to_lowercase()));
    }

    Ok(None)
}

/// Runs the full bring-up sequence for one node: open a Redfish session,
/// characterize the hardware, select a system disk, render PXE/preseed
/// artifacts, apply BIOS/Manager settings, boot, and wait for the
/// installer to report completion. Grounded step-by-step on
/// `original_source/lib/redfish.py::redfish_init`.
pub async fn init_node(
    store: &Store,
    renderer: &ArtifactRenderer,
    notifier: &Notifier,
    cluster_id: i64,
    bmc_macaddr: &str,
    bmc_ipaddr: &str,
    entry: &BootstrapEntry,
) -> Result<(), BootstrapError> {
    let hostname = &entry.node.hostname;
    store
        .update_node_state(cluster_id, hostname, NodeState::Characterizing)
        .await?;
    notifier
        .send(Severity::Begin, &format!("characterizing {hostname}"))
        .await;

    let session = Session::open(bmc_ipaddr, &entry.bmc.username, &entry.bmc.password).await?;
    let result = run_sequence(
        &session,
        store,
        renderer,
        notifier,
        cluster_id,
        bmc_macaddr,
        bmc_ipaddr,
        entry,
    )
    .await;

    if let Err(ref e) = result {
        warn!("bring-up for {} failed: {}", hostname, e);
        store
            .update_node_state(cluster_id, hostname, NodeState::Failed)
            .await?;
        notifier
            .send(Severity::Failure, &format!("{hostname} failed: {e}"))
            .await;
    }

    session.close().await;
    result
}

#[allow(clippy::too_many_arguments)]
async fn run_sequence(
    session: &Session,
    store: &Store,
    renderer: &ArtifactRenderer,
    notifier: &Notifier,
    cluster_id: i64,
    bmc_macaddr: &str,
    bmc_ipaddr: &str,
    entry: &BootstrapEntry,
) -> Result<(), BootstrapError> {
    let hostname = &entry.node.hostname;

    let (characterization, mut system) = characterize(session).await?;
    let system_uri_stub = characterization.system_uri.clone();
    set_power_state(session, &system_uri_stub, false).await?;
    set_indicator_state(session, &system_uri_stub, characterization.vendor, true).await?;
    tokio::time::sleep(Duration::from_secs(60)).await;

    system = session
        .get(&system_uri_stub)
        .await?
        .unwrap_or(system);

    let host_macaddr = resolve_host_macaddr(session, &system)
        .await?
        .ok_or_else(|| {
            BootstrapError::Redfish(format!("could not resolve bootstrap MAC for {hostname}"))
        })?;
    store
        .update_node_addresses(
            cluster_id,
            hostname,
            bmc_macaddr,
            bmc_ipaddr,
            Some(&host_macaddr),
            None,
        )
        .await?;

    let system_drive_target = get_system_drive_target(session, &system, &entry.node.config.system_disks)
        .await?
        .ok_or_else(|| {
            BootstrapError::Redfish(format!("could not select a system disk for {hostname}"))
        })?;

    renderer.render_pxe(&entry.node, &host_macaddr).await?;
    renderer
        .render_preseed(&entry.node, &host_macaddr, &system_drive_target)
        .await?;

    apply_bios_settings(session, &characterization, &entry.bmc.bios_settings).await?;
    // Manager settings are checked against the Manager's own attribute
    // list, not the System's `bios_attributes` list.
    apply_manager_settings(session, &characterization, &entry.bmc.manager_settings).await?;

    set_boot_override_pxe(session, &system_uri_stub).await?;
    set_power_state(session, &system_uri_stub, true).await?;
    store
        .update_node_state(cluster_id, hostname, NodeState::PxeBooting)
        .await?;
    notifier
        .send(Severity::Info, &format!("{hostname} booting PXE installer"))
        .await;

    wait_for_installer_completion(store, cluster_id, hostname).await?;

    set_power_state(session, &system_uri_stub, false).await?;
    wait_power_state(session, &system_uri_stub, "Off").await?;
    set_indicator_state(session, &system_uri_stub, characterization.vendor, false).await?;

    notifier
        .send(Severity::Success, &format!("{hostname} bring-up completed"))
        .await;
    Ok(())
}

/// Keeps only the settings whose key appears in `allowed`. Shared by the
/// BIOS and Manager settings steps so each is filtered against its own
/// attribute list rather than the other's.
fn filter_attributes(
    settings: &std::collections::HashMap<String, Value>,
    allowed: &[String],
) -> serde_json::Map<String, Value> {
    settings
        .iter()
        .filter(|(k, _)| allowed.contains(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

async fn apply_bios_settings(
    session: &Session,
    characterization: &Characterization,
    settings: &std::collections::HashMap<String, Value>,
) -> Result<(), BootstrapError> {
    let applicable = filter_attributes(settings, &characterization.bios_attributes);
    if applicable.is_empty() {
        return Ok(());
    }
    let settings_uri = format!("{}/Settings", characterization.bios_root);
    session
        .patch(&settings_uri, &json!({ "Attributes": applicable }))
        .await?;
    Ok(())
}

async fn apply_manager_settings(
    session: &Session,
    characterization: &Characterization,
    settings: &std::collections::HashMap<String, Value>,
) -> Result<(), BootstrapError> {
    let applicable = filter_attributes(settings, &characterization.manager_attributes);
    if applicable.is_empty() {
        return Ok(());
    }
    session
        .patch(
            &characterization.manager_uri,
            &json!({ "Oem": { "Attributes": applicable } }),
        )
        .await?;
    Ok(())
}

/// Polls the node's own state in the store every 60s, rather than the
/// BMC, since completion is reported in-band by the installed host
/// itself via `/checkin/host` (spec.md §4.6).
async fn wait_for_installer_completion(
    store: &Store,
    cluster_id: i64,
    hostname: &str,
) -> Result<(), BootstrapError> {
    loop {
        let node = store
            .get_node_by_name(cluster_id, hostname)
            .await?
            .ok_or_else(|| BootstrapError::NotFound(format!("node {hostname}")))?;
        match node.state {
            NodeState::BootedCompleted | NodeState::Completed => return Ok(()),
            NodeState::Failed => {
                return Err(BootstrapError::Runner(format!(
                    "node {hostname} reported failure during install"
                )));
            }
            _ => {
                info!("{} still at state {:?}, waiting", hostname, node.state);
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
        }
    }
}
