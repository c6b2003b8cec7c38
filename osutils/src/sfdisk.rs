use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use serde::Deserialize;
use uuid::Uuid;

use sysdefs::filesystems::PartitionFlag;

use crate::dependencies::Dependency;

/// GPT type shorthand for the EFI System Partition, understood by sfdisk.
const TYPE_ESP: &str = "uefi";

/// GPT type GUID for a BIOS boot partition.
const TYPE_BIOS_BOOT: &str = "21686148-6449-6E6F-744E-656564454649";

/// GPT type shorthand for generic Linux data.
const TYPE_LINUX: &str = "linux";

/// One partition of a layout to be applied with `sfdisk`.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionEntry {
    /// GPT partition name, set to the filesystem label of the partition.
    pub name: String,

    /// Size in MiB; `None` grows the partition to fill the remaining space.
    pub size_mib: Option<u64>,

    /// Partition-table flags driving the GPT type GUID.
    pub flags: Vec<PartitionFlag>,
}

impl PartitionEntry {
    fn type_field(&self) -> &'static str {
        if self.flags.contains(&PartitionFlag::Esp) {
            TYPE_ESP
        } else if self.flags.contains(&PartitionFlag::BiosGrub) {
            TYPE_BIOS_BOOT
        } else {
            TYPE_LINUX
        }
    }

    fn render(&self) -> String {
        let mut fields = Vec::with_capacity(3);
        if let Some(size) = self.size_mib {
            fields.push(format!("size={size}MiB"));
        }
        fields.push(format!("type={}", self.type_field()));
        fields.push(format!("name={}", self.name));
        fields.join(", ")
    }
}

/// Renders the sfdisk input script for a fresh GPT layout.
fn render_script(entries: &[PartitionEntry]) -> String {
    let mut script = String::from("label: gpt\n");
    for entry in entries {
        script.push_str(&entry.render());
        script.push('\n');
    }
    script
}

/// Writes a fresh GPT label with the given partitions onto the disk. The disk
/// is taken as a whole; any existing table is replaced.
pub fn apply(disk: impl AsRef<Path>, entries: &[PartitionEntry]) -> Result<(), Error> {
    Dependency::Sfdisk
        .cmd()
        .arg("--wipe")
        .arg("always")
        .arg(disk.as_ref())
        .stdin(render_script(entries).into_bytes())
        .run_and_check()
        .context(format!(
            "Failed to partition '{}'",
            disk.as_ref().display()
        ))
}

/// Asks the kernel to re-read the partition table of the disk.
pub fn reread_table(disk: impl AsRef<Path>) -> Result<(), Error> {
    Dependency::Partprobe
        .cmd()
        .arg(disk.as_ref())
        .run_and_check()
        .context(format!(
            "Failed to re-read partition table of '{}'",
            disk.as_ref().display()
        ))
}

#[derive(Debug, PartialEq, Deserialize)]
struct SfdiskOutput {
    partitiontable: SfDisk,
}

/// Partition table of one disk as reported by `sfdisk -J`.
#[derive(Debug, PartialEq, Deserialize)]
pub struct SfDisk {
    /// Disk label type
    pub label: SfDiskLabel,

    /// Disk UUID
    pub id: Uuid,

    /// Disk device path
    pub device: PathBuf,

    /// First LBA
    pub firstlba: u64,

    /// Last LBA
    pub lastlba: u64,

    /// Sector size
    #[serde(default = "SfDisk::default_sectorsize")]
    pub sectorsize: u64,

    /// List of partitions
    #[serde(default)]
    pub partitions: Vec<SfPartition>,
}

impl SfDisk {
    fn default_sectorsize() -> u64 {
        512
    }

    pub fn get_info<S>(disk: S) -> Result<Self, Error>
    where
        S: AsRef<Path>,
    {
        let output = Dependency::Sfdisk
            .cmd()
            .arg("-J")
            .arg(disk.as_ref())
            .output_and_check()
            .context(format!(
                "Failed to fetch disk information for {}",
                disk.as_ref().display()
            ))?;

        Self::parse(&output).context(format!(
            "Failed to extract disk information for {}",
            disk.as_ref().display()
        ))
    }

    fn parse(output: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str::<SfdiskOutput>(output)
            .context("Failed to parse disk information")?
            .partitiontable)
    }
}

/// One partition as reported by `sfdisk -J`.
#[derive(Debug, PartialEq, Deserialize, Clone)]
pub struct SfPartition {
    /// Partition device path
    pub node: PathBuf,

    /// Partition start offset in sectors
    pub start: u64,

    /// Partition size in sectors
    #[serde(rename = "size")]
    pub size_sectors: u64,

    /// Partition name
    pub name: Option<String>,
}

#[derive(Debug, PartialEq, Deserialize)]
pub enum SfDiskLabel {
    #[serde(rename = "gpt")]
    Gpt,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, size_mib: Option<u64>, flags: Vec<PartitionFlag>) -> PartitionEntry {
        PartitionEntry {
            name: name.into(),
            size_mib,
            flags,
        }
    }

    #[test]
    fn test_render_script() {
        let entries = vec![
            entry("CAP_ESP", Some(512), vec![PartitionFlag::Esp]),
            entry("CAP_STATE", Some(8192), vec![]),
            entry("CAP_PERSIST", None, vec![]),
        ];
        assert_eq!(
            render_script(&entries),
            "label: gpt\n\
             size=512MiB, type=uefi, name=CAP_ESP\n\
             size=8192MiB, type=linux, name=CAP_STATE\n\
             type=linux, name=CAP_PERSIST\n"
        );
    }

    #[test]
    fn test_bios_boot_type() {
        let rendered = entry("bios", Some(1), vec![PartitionFlag::BiosGrub]).render();
        assert_eq!(
            rendered,
            format!("size=1MiB, type={TYPE_BIOS_BOOT}, name=bios")
        );
    }

    #[test]
    fn test_parse_disk() {
        let output = r#"
        {
            "partitiontable": {
               "label": "gpt",
               "id": "3E6494F9-91E1-426B-A25A-0A8101E464A4",
               "device": "/dev/sda",
               "unit": "sectors",
               "firstlba": 34,
               "lastlba": 266338270,
               "sectorsize": 512,
               "partitions": [
                  {
                     "node": "/dev/sda1",
                     "start": 2048,
                     "size": 1048576,
                     "type": "C12A7328-F81F-11D2-BA4B-00A0C93EC93B",
                     "uuid": "F764E91F-9D15-4F6E-8508-0AFC1D0DF0B5",
                     "name": "CAP_ESP"
                  }
               ]
            }
         }
         "#;
        let parsed = SfDisk::parse(output).unwrap();
        assert_eq!(parsed.label, SfDiskLabel::Gpt);
        assert_eq!(parsed.device, PathBuf::from("/dev/sda"));
        assert_eq!(parsed.partitions.len(), 1);
        assert_eq!(parsed.partitions[0].node, PathBuf::from("/dev/sda1"));
        assert_eq!(parsed.partitions[0].name.as_deref(), Some("CAP_ESP"));
    }

    #[test]
    fn test_parse_disk_rejects_garbage() {
        SfDisk::parse("{}").unwrap_err();
        SfDisk::parse("not json").unwrap_err();
    }

    #[test]
    fn test_parse_disk_defaults_sector_size() {
        let output = r#"{
            "partitiontable": {
                "label": "gpt",
                "id": "3E6494F9-91E1-426B-A25A-0A8101E464A4",
                "device": "/dev/sda",
                "firstlba": 2048,
                "lastlba": 67108830
            }
        }"#;
        assert_eq!(
            SfDisk::parse(output).unwrap().sectorsize,
            SfDisk::default_sectorsize()
        );
    }
}
