use std::path::{Path, PathBuf};

use anyhow::{Context, Error};

use crate::dependencies::Dependency;

/// Attaches a free loop device to the given image file and returns its node.
pub fn attach(file: impl AsRef<Path>) -> Result<PathBuf, Error> {
    let output = Dependency::Losetup
        .cmd()
        .arg("--find")
        .arg("--show")
        .arg(file.as_ref())
        .output_and_check()
        .context(format!(
            "Failed to attach loop device to '{}'",
            file.as_ref().display()
        ))?;

    let device = output.trim();
    if device.is_empty() {
        anyhow::bail!(
            "losetup returned no device for '{}'",
            file.as_ref().display()
        );
    }
    Ok(PathBuf::from(device))
}

/// Detaches the given loop device.
pub fn detach(device: impl AsRef<Path>) -> Result<(), Error> {
    Dependency::Losetup
        .cmd()
        .arg("--detach")
        .arg(device.as_ref())
        .run_and_check()
        .context(format!(
            "Failed to detach loop device '{}'",
            device.as_ref().display()
        ))
}

