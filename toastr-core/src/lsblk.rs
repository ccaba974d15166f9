//! Block device snapshots via `lsblk`.
//!
//! The snapshot is the single read-only view of what is attached right now:
//! it shells out to lsblk for SCSI disks in JSON form and turns each entry
//! into a [`DeviceRecord`]. Everything downstream (classification, diffing,
//! display) works on these records and never talks to the OS again.

use std::process::Command;

use serde::Deserialize;

use crate::device::DeviceRecord;
use crate::error::DeviceQueryError;

/// The exact query this tool has always issued: SCSI devices only, JSON
/// output, fixed column set.
const LSBLK_ARGS: [&str; 4] = ["-S", "-J", "-o", "NAME,VENDOR,MODEL,SIZE"];

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(default)]
    vendor: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    size: Option<String>,
}

/// Queries the OS for the currently attached block devices.
///
/// # Errors
///
/// Fails with [`DeviceQueryError`] if lsblk cannot run, exits nonzero, or
/// prints something that is not the expected JSON document. These failures
/// are recoverable: keep the previous inventory and retry on the next
/// refresh trigger.
pub fn take_snapshot() -> Result<Vec<DeviceRecord>, DeviceQueryError> {
    let output = Command::new("lsblk")
        .args(LSBLK_ARGS)
        .output()
        .map_err(DeviceQueryError::Spawn)?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(DeviceQueryError::Failed {
            status: output.status,
            stderr,
        });
    }

    parse(&output.stdout)
}

/// Parses raw lsblk JSON into device records.
///
/// Split from [`take_snapshot`] so the parsing rules are testable without a
/// live system. Devices missing the optional vendor/model/size fields get
/// empty strings before descriptor rendering.
pub fn parse(bytes: &[u8]) -> Result<Vec<DeviceRecord>, DeviceQueryError> {
    let parsed: LsblkOutput = serde_json::from_slice(bytes)?;

    Ok(parsed
        .blockdevices
        .into_iter()
        .map(|dev| {
            DeviceRecord::new(
                &dev.name,
                dev.vendor.as_deref().unwrap_or(""),
                dev.model.as_deref().unwrap_or(""),
                dev.size.as_deref().unwrap_or(""),
            )
        })
        .collect())
}
