// src/redfish/disk.rs

//! Human-readable byte formatting and system-drive-target resolution.
//! Grounded on `original_source/lib/redfish.py`'s `format_bytes_tohuman`
//! and `get_system_drive_target`.

use regex::Regex;
use serde_json::Value;

use super::session::Session;
use crate::error::BootstrapError;

const UNITS: [&str; 7] = ["B", "KB", "MB", "GB", "TB", "PB", "EB"];

/// Base-1000 byte formatter. TB/PB/EB values within 2% of the next whole
/// number are rounded up rather than shown with two decimals, since a
/// "3.98TB" drive is almost always marketed and partitioned as "4TB".
pub fn format_bytes_tohuman(databytes: f64) -> String {
    let mut value = databytes;
    for (idx, unit) in UNITS.iter().enumerate() {
        if value <= 999.0 || idx == UNITS.len() - 1 {
            if idx >= 4 {
                let ceil = value.ceil();
                if value > 0.0 && (ceil - value) / value <= 0.02 {
                    return format!("{}{}", ceil as i64, unit);
                }
            }
            if idx == 0 {
                return format!("{}{}", value as i64, unit);
            }
            return format!("{:.2}{}", value, unit);
        }
        value /= 1000.0;
    }
    unreachable!("UNITS is non-empty")
}

struct DriveInfo {
    id: String,
    uri: String,
    model: String,
    size_bytes: f64,
}

fn bay_id(drive_id: &str) -> &str {
    drive_id.split(':').next().unwrap_or(drive_id)
}

/// Composes a cspec `system_disks` entry (a bare chassis bay number, e.g.
/// `"2"`) into the drive-Id-prefix form Redfish reports it under, matching
/// `original_source/lib/redfish.py::get_system_drive_target`'s
/// `f"Drive.Bay.{cspec_drive}"`.
fn chassis_bay_label(bay: &str) -> String {
    format!("Drive.Bay.{bay}")
}

fn controller_id(drive_id: &str) -> &str {
    drive_id.rsplit(':').next().unwrap_or(drive_id)
}

async fn list_system_drives(
    session: &Session,
    system: &Value,
) -> Result<Vec<DriveInfo>, BootstrapError> {
    let mut drives = Vec::new();
    let Some(storage_uri) = system.get("Storage").and_then(|s| s.get("@odata.id")).and_then(|v| v.as_str())
    else {
        return Ok(drives);
    };

    let Some(storage) = session.get(storage_uri).await? else {
        return Ok(drives);
    };
    let members = storage
        .get("Members")
        .and_then(|m| m.as_array())
        .cloned()
        .unwrap_or_default();

    for member in members {
        let Some(member_uri) = member.get("@odata.id").and_then(|v| v.as_str()) else {
            continue;
        };
        let Some(controller) = session.get(member_uri).await? else {
            continue;
        };
        let drive_refs = controller
            .get("Drives")
            .and_then(|d| d.as_array())
            .cloned()
            .unwrap_or_default();
        for drive_ref in drive_refs {
            let Some(drive_uri) = drive_ref.get("@odata.id").and_then(|v| v.as_str()) else {
                continue;
            };
            let Some(drive) = session.get(drive_uri).await? else {
                continue;
            };
            let id = drive.get("Id").and_then(|v| v.as_str()).unwrap_or("").to_string();
            let model = drive
                .get("Model")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();
            let size_bytes = drive
                .get("CapacityBytes")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            drives.push(DriveInfo {
                id,
                uri: drive_uri.to_string(),
                model,
                size_bytes,
            });
        }
    }
    Ok(drives)
}

/// Resolves the `system_disks` cspec entry (at most the first two bay
/// references) into a PXE preseed disk target: a literal `/dev/...` or
/// `detect:...` string is passed through; otherwise bays are matched
/// against the system's actual drives, and either a single-drive
/// `detect:` descriptor or a fresh RAID-1 volume is synthesized.
pub async fn get_system_drive_target(
    session: &Session,
    system: &Value,
    system_disks: &[String],
) -> Result<Option<String>, BootstrapError> {
    let requested: Vec<String> = system_disks.iter().take(2).cloned().collect();
    let Some(first) = requested.first() else {
        return Ok(None);
    };

    if system.get("Storage").is_none() {
        return Ok(Some(first.clone()));
    }

    let verbatim = Regex::new(r"^(/dev|detect:)").expect("static regex");
    if verbatim.is_match(first) {
        return Ok(Some(first.clone()));
    }

    let drives = list_system_drives(session, system).await?;
    let matches: Vec<&DriveInfo> = drives
        .iter()
        .filter(|d| requested.iter().any(|bay| bay_id(&d.id) == chassis_bay_label(bay)))
        .collect();

    match matches.len() {
        1 => {
            let drive = matches[0];
            let model_word = drive.model.split_whitespace().next().unwrap_or("disk");
            let human = format_bytes_tohuman(drive.size_bytes);
            let idx = drives
                .iter()
                .filter(|d| d.model == drive.model && d.size_bytes == drive.size_bytes)
                .position(|d| d.id == drive.id)
                .unwrap_or(0);
            Ok(Some(format!("detect:{model_word}:{human}:{idx}")))
        }
        2 => {
            let a = matches[0];
            let b = matches[1];
            if controller_id(&a.id) != controller_id(&b.id) {
                return Ok(None);
            }
            create_mirror_volume(session, system, a, b).await
        }
        _ => Ok(None),
    }
}

async fn create_mirror_volume(
    session: &Session,
    system: &Value,
    a: &DriveInfo,
    b: &DriveInfo,
) -> Result<Option<String>, BootstrapError> {
    let Some(storage_uri) = system.get("Storage").and_then(|s| s.get("@odata.id")).and_then(|v| v.as_str())
    else {
        return Ok(None);
    };
    let Some(storage) = session.get(storage_uri).await? else {
        return Ok(None);
    };
    let members = storage
        .get("Members")
        .and_then(|m| m.as_array())
        .cloned()
        .unwrap_or_default();

    for member in members {
        let Some(member_uri) = member.get("@odata.id").and_then(|v| v.as_str()) else {
            continue;
        };
        if bay_id(&a.id).is_empty() {
            continue;
        }
        let Some(controller) = session.get(member_uri).await? else {
            continue;
        };
        let Some(volumes_uri) = controller
            .get("Volumes")
            .and_then(|v| v.get("@odata.id"))
            .and_then(|v| v.as_str())
        else {
            continue;
        };
        if controller_id(&a.id) != controller.get("Id").and_then(|v| v.as_str()).unwrap_or("") {
            continue;
        }

        let Some(before) = session.get(volumes_uri).await? else {
            continue;
        };
        let before_ids = volume_ids(&before);

        let body = serde_json::json!({
            "VolumeType": "Mirrored",
            "RAIDType": "RAID1",
            "Drives": [
                { "@odata.id": a.uri },
                { "@odata.id": b.uri },
            ],
        });
        session.post(volumes_uri, &body).await?;

        for _ in 0..60 {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            let Some(after) = session.get(volumes_uri).await? else {
                continue;
            };
            let after_ids = volume_ids(&after);
            if let Some(new_id) = after_ids.iter().find(|id| !before_ids.contains(*id)) {
                let Some(volume) = session.get(new_id).await? else {
                    continue;
                };
                let size = volume
                    .get("CapacityBytes")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0);
                let controller_word = controller
                    .get("Name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("controller")
                    .split_whitespace()
                    .next()
                    .unwrap_or("controller");
                let volume_idx = after_ids.iter().position(|id| id == new_id).unwrap_or(0);
                return Ok(Some(format!(
                    "detect:{controller_word}:{}:{volume_idx}",
                    format_bytes_tohuman(size)
                )));
            }
        }
        return Ok(None);
    }
    Ok(None)
}

fn volume_ids(volumes: &Value) -> Vec<String> {
    volumes
        .get("Members")
        .and_then(|m| m.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|m| m.get("@odata.id").and_then(|v| v.as_str()))
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_small_values_without_decimals() {
        assert_eq!(format_bytes_tohuman(512.0), "512B");
    }

    #[test]
    fn formats_gigabytes_with_two_decimals() {
        assert_eq!(format_bytes_tohuman(128_000_000_000.0), "128.00GB");
    }

    #[test]
    fn rounds_near_whole_terabyte_values_up() {
        // 3.98TB drives are marketed and should format as a round "4TB".
        let bytes = 3_980_000_000_000.0;
        assert_eq!(format_bytes_tohuman(bytes), "4TB");
    }

    #[test]
    fn does_not_round_terabyte_values_far_from_whole() {
        assert_eq!(format_bytes_tohuman(3_500_000_000_000.0), "3.50TB");
    }

    #[test]
    fn chassis_bay_label_matches_the_drive_id_prefix_redfish_reports() {
        let drive_id = "Drive.Bay.2:Enclosure.Internal.0-1:RAID.Integrated.1-1";
        assert_eq!(bay_id(drive_id), chassis_bay_label("2"));
        assert_ne!(bay_id(drive_id), "2");
    }

    #[test]
    fn chassis_bay_label_does_not_match_an_unrelated_bay() {
        let drive_id = "Drive.Bay.2:Enclosure.Internal.0-1:RAID.Integrated.1-1";
        assert_ne!(bay_id(drive_id), chassis_bay_label("3"));
    }
}
