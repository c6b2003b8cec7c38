use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use serde::Deserialize;

use crate::dependencies::Dependency;

/// Columns requested from lsblk. Kept minimal so the parse stays stable across
/// util-linux versions.
const LSBLK_COLUMNS: &str = "NAME,PATH,LABEL,FSTYPE,SIZE,TYPE,MOUNTPOINT,PKNAME";

#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
pub struct LsBlkOutput {
    pub blockdevices: Vec<BlockDevice>,
}

/// Represents a block device as returned by `lsblk --json`. See `man lsblk`
/// for more information.
#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
pub struct BlockDevice {
    /// Device name
    pub name: String,

    /// Full device path
    pub path: PathBuf,

    /// Filesystem label
    pub label: Option<String>,

    /// Filesystem type
    pub fstype: Option<String>,

    /// Size of the device in bytes
    pub size: u64,

    /// Device type as reported by the kernel (disk, part, crypt, loop, ...)
    #[serde(rename = "type")]
    pub blkdev_type: BlockDeviceType,

    /// Where the device is mounted
    #[serde(default)]
    pub mountpoint: Option<PathBuf>,

    /// Internal parent kernel device name
    #[serde(rename = "pkname")]
    pub parent_kernel_name: Option<String>,

    /// List of children devices, e.g. partitions of a disk
    #[serde(default)]
    pub children: Vec<BlockDevice>,
}

impl BlockDevice {
    /// Gets a list of all mountpoints for this device and its children.
    pub fn all_mountpoints_recursive(&self) -> Vec<&Path> {
        self.mountpoint
            .iter()
            .map(|p| p.as_path())
            .chain(
                self.children
                    .iter()
                    .flat_map(|ch| ch.all_mountpoints_recursive()),
            )
            .collect()
    }

    /// Depth-first iteration over this device and all descendants.
    pub fn flatten(&self) -> Vec<&BlockDevice> {
        let mut out = vec![self];
        for child in &self.children {
            out.extend(child.flatten());
        }
        out
    }
}

/// Device types returned by lsblk that the agent distinguishes. Anything else
/// (md, lvm, mpath, ...) collapses to `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockDeviceType {
    Disk,
    Partition,
    Crypt,
    Loop,
    Rom,
    #[default]
    Other,
}

impl<'de> Deserialize<'de> for BlockDeviceType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match String::deserialize(deserializer)?.as_str() {
            "disk" => Self::Disk,
            "part" => Self::Partition,
            "crypt" => Self::Crypt,
            "loop" => Self::Loop,
            "rom" => Self::Rom,
            _ => Self::Other,
        })
    }
}

/// Lists all block devices on the system.
pub fn list() -> Result<Vec<BlockDevice>, Error> {
    let output = Dependency::Lsblk
        .cmd()
        .arg("--json")
        .arg("--bytes")
        .arg("--output")
        .arg(LSBLK_COLUMNS)
        .output_and_check()
        .context("Failed to execute lsblk")?;

    parse(&output)
}

/// Describes a single device.
pub fn get(device_path: impl AsRef<Path>) -> Result<BlockDevice, Error> {
    let output = Dependency::Lsblk
        .cmd()
        .arg("--json")
        .arg("--bytes")
        .arg("--output")
        .arg(LSBLK_COLUMNS)
        .arg(device_path.as_ref())
        .output_and_check()
        .context(format!(
            "Failed to execute lsblk for '{}'",
            device_path.as_ref().display()
        ))?;

    parse(&output)?
        .into_iter()
        .next()
        .context(format!(
            "lsblk returned no device for '{}'",
            device_path.as_ref().display()
        ))
}

/// Returns all devices, at any depth, matching the given predicate.
pub fn find(predicate: impl Fn(&BlockDevice) -> bool) -> Result<Vec<BlockDevice>, Error> {
    Ok(list()?
        .iter()
        .flat_map(|device| device.flatten())
        .filter(|device| predicate(device))
        .cloned()
        .collect())
}

fn parse(output: &str) -> Result<Vec<BlockDevice>, Error> {
    Ok(serde_json::from_str::<LsBlkOutput>(output)
        .context("Failed to parse lsblk output")?
        .blockdevices)
}
