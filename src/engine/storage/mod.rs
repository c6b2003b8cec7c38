pub mod deploy;
pub mod encryption;
pub mod partitioning;

use std::path::PathBuf;

use capstan_api::config::ImageSource;
use sysdefs::filesystems::{FilesystemKind, PartitionFlag};

/// One block-device partition the agent owns. For LUKS partitions, `path`
/// stays the underlying block device; the unlocked mapper node is tracked
/// separately by the encryption engine so closing never goes by label.
#[derive(Debug, Clone)]
pub struct Partition {
    /// Filesystem label; the primary lookup key.
    pub label: String,

    /// Kernel device node base name, e.g. `sda2`.
    pub name: String,

    /// Full device path.
    pub path: PathBuf,

    /// Path of the containing disk.
    pub disk: PathBuf,

    /// Requested or observed size in MiB; `0` means "grow to fill".
    pub size_mib: u64,

    /// Filesystem kind.
    pub fs: FilesystemKind,

    /// Partition-table flags.
    pub flags: Vec<PartitionFlag>,

    /// Current mountpoint when mounted.
    pub mount_point: Option<PathBuf>,
}

// Partitions are compared by device path; the inventory may carry the same
// node with different probe detail.
impl PartialEq for Partition {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Partition {
    /// Mapper name the unlocked LUKS container appears under.
    pub fn mapper_name(&self) -> String {
        self.label.to_lowercase()
    }

    pub fn is_mounted(&self) -> bool {
        self.mount_point.is_some()
    }

    /// Filesystem found inside the mapper once the partition is unlocked.
    pub fn fs_after_unlock(&self) -> FilesystemKind {
        match self.fs {
            FilesystemKind::Luks => FilesystemKind::Ext4,
            other => other,
        }
    }
}

/// A filesystem image file, loop-mounted while it is being populated.
#[derive(Debug, Clone)]
pub struct Image {
    /// On-disk path of the image file when it is a loopback artefact.
    pub file: Option<PathBuf>,

    /// Filesystem label to stamp on the image.
    pub label: String,

    /// Image filesystem kind.
    pub fs: FilesystemKind,

    /// Declared size in MiB.
    pub size_mib: u64,

    /// Where the payload comes from.
    pub source: ImageSource,

    /// Where the image is currently mounted.
    pub mount_point: Option<PathBuf>,

    /// Loop device node; set if and only if the image is mounted.
    pub loop_device: Option<PathBuf>,
}

impl Image {
    pub fn new(label: impl Into<String>, fs: FilesystemKind, source: ImageSource) -> Self {
        Self {
            file: None,
            label: label.into(),
            fs,
            size_mib: 0,
            source,
            mount_point: None,
            loop_device: None,
        }
    }

    pub fn with_file(mut self, file: impl Into<PathBuf>, size_mib: u64) -> Self {
        self.file = Some(file.into());
        self.size_mib = size_mib;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_equality_is_by_path() {
        let a = Partition {
            label: "CAP_OEM".into(),
            name: "sda3".into(),
            path: "/dev/sda3".into(),
            disk: "/dev/sda".into(),
            size_mib: 64,
            fs: FilesystemKind::Ext4,
            flags: vec![],
            mount_point: None,
        };
        let mut b = a.clone();
        b.label = "OTHER".into();
        b.mount_point = Some("/oem".into());
        assert_eq!(a, b);

        b.path = "/dev/sda4".into();
        assert_ne!(a, b);
    }

    #[test]
    fn test_mapper_name_is_lowercased_label() {
        let partition = Partition {
            label: "MYDATA".into(),
            name: "sdb1".into(),
            path: "/dev/sdb1".into(),
            disk: "/dev/sdb".into(),
            size_mib: 0,
            fs: FilesystemKind::Luks,
            flags: vec![],
            mount_point: None,
        };
        assert_eq!(partition.mapper_name(), "mydata");
    }
}
