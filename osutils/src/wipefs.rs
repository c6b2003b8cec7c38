use std::path::Path;

use anyhow::{Context, Error};

use crate::dependencies::Dependency;

/// Erases all filesystem, RAID, and partition-table signatures from the
/// device.
pub fn all(device_path: impl AsRef<Path>) -> Result<(), Error> {
    Dependency::Wipefs
        .cmd()
        .arg("--all")
        .arg(device_path.as_ref())
        .run_and_check()
        .context(format!(
            "Failed to wipe signatures from '{}'",
            device_path.as_ref().display()
        ))
}
