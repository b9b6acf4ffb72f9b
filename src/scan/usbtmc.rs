//! USB-TMC device scan.
//!
//! Enumerates `/dev/usbtmc*` nodes created by the Linux `usbtmc` kernel
//! driver and reads each device's USB identity from sysfs. The match
//! predicate receives the vendor/product/serial info rather than an `*IDN?`
//! string, so drivers can recognize their hardware without opening it.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::discovery::Candidate;
use crate::error::Result;
use crate::hwinfo::HardwareInfo;

/// USB identity of one TMC device node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsbTmcDeviceInfo {
    /// Character device path (e.g. `/dev/usbtmc0`).
    pub path: String,
    /// USB vendor id, lowercase hex without prefix (e.g. `0957`).
    pub vendor_id: Option<String>,
    /// USB product id, lowercase hex without prefix.
    pub product_id: Option<String>,
    /// USB serial number string.
    pub serial: Option<String>,
    /// USB product name string.
    pub product: Option<String>,
}

/// Scan USB-TMC device nodes, matching on USB identity.
///
/// On hosts without the `usbtmc` kernel driver (or without any TMC device)
/// the scan yields zero candidates.
pub async fn scan<M>(_info: &HardwareInfo, matcher: M) -> Result<Vec<Candidate>>
where
    M: Fn(&UsbTmcDeviceInfo) -> bool + Send + Sync,
{
    let devices = tokio::task::spawn_blocking(enumerate)
        .await
        .unwrap_or_default();
    debug!(devices = devices.len(), "usbtmc scan");

    Ok(devices
        .into_iter()
        .filter(|device| {
            let matched = matcher(device);
            debug!(path = %device.path, matched, "usbtmc device examined");
            matched
        })
        .map(|device| Candidate::usbtmc(device.path))
        .collect())
}

/// Enumerate `/dev/usbtmc*` nodes with their sysfs identity.
fn enumerate() -> Vec<UsbTmcDeviceInfo> {
    let entries = match std::fs::read_dir("/dev") {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    let mut devices = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with("usbtmc") || !name[6..].chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        devices.push(identify(&name, entry.path()));
    }
    devices
}

/// Read the USB identity for one node from sysfs.
///
/// The class device at `/sys/class/usbmisc/usbtmcN/device` points at the USB
/// interface; its parent directory holds the device-level descriptors.
fn identify(name: &str, dev_path: PathBuf) -> UsbTmcDeviceInfo {
    let usb_device = Path::new("/sys/class/usbmisc")
        .join(name)
        .join("device")
        .join("..");
    UsbTmcDeviceInfo {
        path: dev_path.to_string_lossy().into_owned(),
        vendor_id: sysfs_attr(&usb_device, "idVendor"),
        product_id: sysfs_attr(&usb_device, "idProduct"),
        serial: sysfs_attr(&usb_device, "serial"),
        product: sysfs_attr(&usb_device, "product"),
    }
}

fn sysfs_attr(dir: &Path, attr: &str) -> Option<String> {
    std::fs::read_to_string(dir.join(attr))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
