use std::path::{Path, PathBuf};

use anyhow::{Context, Error};

use crate::dependencies::Dependency;

fn probe(device_path: impl AsRef<Path>, tag: &str) -> Result<String, Error> {
    let output = Dependency::Blkid
        .cmd()
        .arg("-o") // output format
        .arg("value") // single value
        .arg("-s") // tag
        .arg(tag)
        .arg(device_path.as_ref())
        .output_and_check()
        .context("Failed to execute blkid")?;

    Ok(output.trim().to_owned())
}

/// Returns the filesystem label of the given device.
pub fn get_label(device_path: impl AsRef<Path>) -> Result<String, Error> {
    probe(device_path, "LABEL")
}

/// Resolves the device carrying the given filesystem label, if any.
///
/// `blkid --label` prints the device path and exits non-zero when the label is
/// unknown; absence maps to `Ok(None)` here so callers can drive their own
/// retry policy.
pub fn get_device_by_label(label: &str) -> Result<Option<PathBuf>, Error> {
    let output = Dependency::Blkid
        .cmd()
        .arg("--label")
        .arg(label)
        .output()
        .context("Failed to execute blkid")?;

    if !output.success() {
        return Ok(None);
    }

    let device = output.output().trim().to_owned();
    Ok((!device.is_empty()).then(|| PathBuf::from(device)))
}
