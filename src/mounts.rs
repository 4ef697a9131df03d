//! Refusing to write to devices with mounted filesystems.

use crate::platform;
use anyhow::Context as _;
use std::path::Path;

/// Whether any entry in the mount table has a source starting with the device path.
///
/// This is a plain prefix match, so partitions of a disk (`/dev/sdb1` for
/// `/dev/sdb`) count as the disk being mounted.
pub(crate) fn device_is_mounted(mount_table: &str, device: &Path) -> bool {
    let device = device.to_string_lossy();
    mount_table.lines().any(|line| line.starts_with(&*device))
}

/// Checks the platform's mount table for the device, under its given name and
/// under the name its symlinks resolve to.
pub(crate) fn is_mounted(device: &Path) -> anyhow::Result<bool> {
    let mount_table = platform::mount_table()?;
    if device_is_mounted(&mount_table, device) {
        return Ok(true);
    }
    let resolved = std::fs::canonicalize(device)
        .with_context(|| format!("Resolving {device:?}"))?;
    Ok(device_is_mounted(&mount_table, &resolved))
}
