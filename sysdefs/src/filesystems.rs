use anyhow::bail;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Filesystem kinds the agent knows how to create, mount, or deploy into.
///
/// `Luks` is not a real filesystem; it marks a partition that holds a LUKS2
/// container whose mapper carries the actual filesystem.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FilesystemKind {
    Ext2,
    #[default]
    Ext4,
    Vfat,
    Squashfs,
    Iso9660,
    Xfs,
    Btrfs,
    Luks,
}

impl FilesystemKind {
    /// Name accepted by `mount -t`.
    pub fn mount_name(self) -> &'static str {
        match self {
            Self::Ext2 => "ext2",
            Self::Ext4 => "ext4",
            Self::Vfat => "vfat",
            Self::Squashfs => "squashfs",
            Self::Iso9660 => "iso9660",
            Self::Xfs => "xfs",
            Self::Btrfs => "btrfs",
            // A LUKS container is never mounted directly; the mapper is.
            Self::Luks => "auto",
        }
    }

    /// Suffix accepted by `mkfs.<suffix>`.
    pub fn mkfs_name(self) -> Result<&'static str, anyhow::Error> {
        Ok(match self {
            Self::Ext2 => "ext2",
            Self::Ext4 => "ext4",
            Self::Vfat => "vfat",
            Self::Xfs => "xfs",
            Self::Btrfs => "btrfs",
            Self::Squashfs | Self::Iso9660 | Self::Luks => {
                bail!("'{self}' cannot be created with mkfs")
            }
        })
    }

    /// Whether a filesystem of this kind carries a volume label that mkfs can
    /// stamp at creation time.
    pub fn supports_label(self) -> bool {
        !matches!(self, Self::Squashfs | Self::Iso9660 | Self::Luks)
    }

    /// Whether this is an ext-family filesystem.
    pub fn is_ext(self) -> bool {
        matches!(self, Self::Ext2 | Self::Ext4)
    }
}

/// GPT partition-table flags understood by the partitioner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PartitionFlag {
    Boot,
    Esp,
    BiosGrub,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_names() {
        assert_eq!(FilesystemKind::Ext4.mount_name(), "ext4");
        assert_eq!(FilesystemKind::Vfat.mount_name(), "vfat");
        assert_eq!(FilesystemKind::Squashfs.mount_name(), "squashfs");
        assert_eq!(FilesystemKind::Luks.mount_name(), "auto");
    }

    #[test]
    fn test_mkfs_names() {
        assert_eq!(FilesystemKind::Ext2.mkfs_name().unwrap(), "ext2");
        assert_eq!(FilesystemKind::Btrfs.mkfs_name().unwrap(), "btrfs");
        FilesystemKind::Squashfs.mkfs_name().unwrap_err();
        FilesystemKind::Luks.mkfs_name().unwrap_err();
    }

    #[test]
    fn test_label_support() {
        assert!(FilesystemKind::Ext4.supports_label());
        assert!(FilesystemKind::Vfat.supports_label());
        assert!(!FilesystemKind::Squashfs.supports_label());
    }

    #[test]
    fn test_serde_round_trip() {
        let kind: FilesystemKind = serde_json::from_str("\"squashfs\"").unwrap();
        assert_eq!(kind, FilesystemKind::Squashfs);
        assert_eq!(serde_json::to_string(&kind).unwrap(), "\"squashfs\"");

        let flag: PartitionFlag = serde_json::from_str("\"bios_grub\"").unwrap();
        assert_eq!(flag, PartitionFlag::BiosGrub);
    }
}
