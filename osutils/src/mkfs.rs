use std::path::Path;

use anyhow::{Context, Error};

use sysdefs::filesystems::FilesystemKind;

use crate::dependencies::Dependency;

/// Creates a filesystem on the device.
pub fn run(device_path: &Path, filesystem: FilesystemKind) -> Result<(), Error> {
    Dependency::Mkfs
        .cmd()
        .arg("--type")
        .arg(filesystem.mkfs_name()?)
        .arg(device_path)
        .run_and_check()
        .context("Failed to execute mkfs")
}

/// Creates a filesystem on the device and stamps the given volume label.
pub fn run_labeled(device_path: &Path, filesystem: FilesystemKind, label: &str) -> Result<(), Error> {
    let mut cmd = Dependency::Mkfs.cmd();
    cmd.arg("--type").arg(filesystem.mkfs_name()?);

    // mkfs.vfat spells the label flag differently from the ext tools
    match filesystem {
        FilesystemKind::Vfat => cmd.arg("-n").arg(label),
        _ => cmd.arg("-L").arg(label),
    };

    cmd.arg(device_path)
        .run_and_check()
        .context(format!(
            "Failed to create {filesystem} filesystem labeled '{label}'"
        ))
}
