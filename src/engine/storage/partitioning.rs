use std::{
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use anyhow::{Context, Error};
use log::{debug, info, warn};

use capstan_api::{
    config::InstallSpec,
    constants::{ESP_MIN_SIZE_MIB, PARTITION_SIZE_GROW},
    error::{CapstanError, InvalidConfigError, ReportError, StorageError},
};
use osutils::{blkid, cryptsetup, dmsetup, lsblk, mkfs, mount, sfdisk, udevadm, wipefs};
use sysdefs::filesystems::{FilesystemKind, PartitionFlag};

use super::{Image, Partition};

/// A mount's inverse operation, pushed onto the cleanup stack by the caller.
pub type Closer = Box<dyn FnOnce() -> Result<(), Error>>;

/// Discovers the partitions present on the system, with their disks and
/// labels. The kernel's view under /sys/block is preferred; when that probe
/// fails, the block utility's JSON listing serves as fallback.
pub fn inventory() -> Result<Vec<Partition>, CapstanError> {
    match sysfs_inventory() {
        Ok(partitions) => Ok(partitions),
        Err(e) => {
            warn!("Kernel block probe failed, falling back to lsblk: {e:#}");
            lsblk_inventory().structured(StorageError::Inventory)
        }
    }
}

fn sysfs_inventory() -> Result<Vec<Partition>, Error> {
    let mut partitions = Vec::new();

    for disk_entry in std::fs::read_dir("/sys/block").context("Failed to read /sys/block")? {
        let disk_entry = disk_entry.context("Failed to read /sys/block entry")?;
        let disk_name = disk_entry.file_name().to_string_lossy().to_string();
        // Loopback and ram devices carry no partitions the agent owns
        if disk_name.starts_with("loop") || disk_name.starts_with("ram") {
            continue;
        }
        let disk_path = PathBuf::from("/dev").join(&disk_name);

        for entry in std::fs::read_dir(disk_entry.path())
            .context(format!("Failed to read /sys/block/{disk_name}"))?
        {
            let entry = entry.context("Failed to read sysfs entry")?;
            if !entry.path().join("partition").exists() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let path = PathBuf::from("/dev").join(&name);

            let size_mib = std::fs::read_to_string(entry.path().join("size"))
                .ok()
                .and_then(|sectors| sectors.trim().parse::<u64>().ok())
                .map(|sectors| sectors * 512 / (1024 * 1024))
                .unwrap_or(0);

            let mount_point = proc_mount_point(&path)?;
            partitions.push(Partition {
                label: blkid::get_label(&path).unwrap_or_default(),
                name,
                path,
                disk: disk_path.clone(),
                size_mib,
                fs: FilesystemKind::default(),
                flags: vec![],
                mount_point,
            });
        }
    }

    Ok(partitions)
}

fn proc_mount_point(device: &Path) -> Result<Option<PathBuf>, Error> {
    let mounts =
        std::fs::read_to_string("/proc/mounts").context("Failed to read /proc/mounts")?;
    let needle = device.to_string_lossy();
    Ok(mounts
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            Some((fields.next()?, fields.next()?))
        })
        .find(|(dev, _)| *dev == needle)
        .map(|(_, mount_point)| PathBuf::from(mount_point)))
}

fn lsblk_inventory() -> Result<Vec<Partition>, Error> {
    let mut partitions = Vec::new();
    for disk in lsblk::list()? {
        if disk.blkdev_type != lsblk::BlockDeviceType::Disk {
            continue;
        }
        for child in &disk.children {
            if child.blkdev_type != lsblk::BlockDeviceType::Partition {
                continue;
            }
            partitions.push(Partition {
                label: child.label.clone().unwrap_or_default(),
                name: child.name.clone(),
                path: child.path.clone(),
                disk: disk.path.clone(),
                size_mib: child.size / (1024 * 1024),
                fs: child
                    .fstype
                    .as_deref()
                    .and_then(probe_filesystem)
                    .unwrap_or_default(),
                flags: vec![],
                mount_point: child.mountpoint.clone(),
            });
        }
    }
    Ok(partitions)
}

fn probe_filesystem(fstype: &str) -> Option<FilesystemKind> {
    match fstype {
        "crypto_LUKS" => Some(FilesystemKind::Luks),
        other => other.parse().ok(),
    }
}

/// Closes every active device-mapper crypt target. A previously opened LUKS
/// mapping would otherwise hold a handle on the disk across repartitioning.
pub fn deactivate_device_mappers(disk: &Path) -> Result<(), CapstanError> {
    let targets = dmsetup::list_targets("crypt").structured(StorageError::DeactivateMappers {
        disk: disk.display().to_string(),
    })?;

    for target in targets {
        debug!("Closing pre-existing crypt target '{target}'");
        cryptsetup::luks_close(&target).structured(StorageError::DeactivateMappers {
            disk: disk.display().to_string(),
        })?;
    }

    Ok(())
}

/// Converts the declared layout to partitioner entries, enforcing the rules
/// the partitioner itself cannot express.
fn plan_entries(spec: &InstallSpec) -> Result<Vec<sfdisk::PartitionEntry>, CapstanError> {
    let mut entries = Vec::with_capacity(spec.partitions.len());
    for (position, partition) in spec.partitions.iter().enumerate() {
        if partition.size_mib == PARTITION_SIZE_GROW && position + 1 != spec.partitions.len() {
            return Err(CapstanError::new(
                InvalidConfigError::GrowPartitionNotLast {
                    label: partition.label.clone(),
                },
            ));
        }
        if partition.flags.contains(&PartitionFlag::Esp) && partition.size_mib < ESP_MIN_SIZE_MIB {
            return Err(CapstanError::new(InvalidConfigError::EspTooSmall {
                label: partition.label.clone(),
                min_mib: ESP_MIN_SIZE_MIB,
            }));
        }
        entries.push(sfdisk::PartitionEntry {
            name: partition.label.clone(),
            size_mib: (partition.size_mib != PARTITION_SIZE_GROW).then_some(partition.size_mib),
            flags: partition.flags.clone(),
        });
    }
    Ok(entries)
}

/// Wipes the disk, writes the declared layout, and formats each partition.
///
/// Not atomic: a failure partway leaves the disk inconsistent, and the whole
/// install must be treated as failed.
pub fn partition_and_format(spec: &InstallSpec) -> Result<Vec<Partition>, CapstanError> {
    let disk = &spec.device;
    let entries = plan_entries(spec)?;

    info!("Partitioning '{}'", disk.display());
    wipefs::all(disk).structured(StorageError::WipeDisk {
        disk: disk.display().to_string(),
    })?;
    sfdisk::apply(disk, &entries).structured(StorageError::PartitionDisk {
        disk: disk.display().to_string(),
    })?;
    sfdisk::reread_table(disk).structured(StorageError::PartitionDisk {
        disk: disk.display().to_string(),
    })?;
    udevadm::settle().structured(StorageError::PartitionDisk {
        disk: disk.display().to_string(),
    })?;

    // Read the table back to learn the device nodes the kernel assigned
    let table = sfdisk::SfDisk::get_info(disk).structured(StorageError::PartitionDisk {
        disk: disk.display().to_string(),
    })?;

    let mut partitions = Vec::with_capacity(spec.partitions.len());
    for declared in &spec.partitions {
        let node = table
            .partitions
            .iter()
            .find(|p| p.name.as_deref() == Some(declared.label.as_str()))
            .map(|p| p.node.clone())
            .structured(StorageError::DeviceNotFound {
                label: declared.label.clone(),
                retries: 0,
            })?;

        // LUKS partitions get their filesystem inside the container later
        if declared.fs != FilesystemKind::Luks {
            format_partition(&node, declared.fs, &declared.label)?;
        }

        partitions.push(Partition {
            label: declared.label.clone(),
            name: node
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default(),
            path: node,
            disk: disk.clone(),
            size_mib: declared.size_mib,
            fs: declared.fs,
            flags: declared.flags.clone(),
            mount_point: None,
        });
    }

    Ok(partitions)
}

/// Formats one partition, stamping its label.
pub fn format_partition(
    node: &Path,
    fs: FilesystemKind,
    label: &str,
) -> Result<(), CapstanError> {
    debug!("Formatting '{}' as {fs} ('{label}')", node.display());
    let result = if fs.supports_label() {
        mkfs::run_labeled(node, fs, label)
    } else {
        mkfs::run(node, fs)
    };
    result.structured(StorageError::Format {
        node: node.display().to_string(),
    })
}

/// Resolves the device carrying the given label, retrying once per second up
/// to `max_tries`, settling udev between attempts.
pub fn get_device_by_label(label: &str, max_tries: u64) -> Result<PathBuf, CapstanError> {
    for attempt in 1..=max_tries {
        if let Some(device) = blkid::get_device_by_label(label)
            .structured(StorageError::Inventory)?
        {
            return Ok(device);
        }
        debug!("Label '{label}' not found (attempt {attempt}/{max_tries})");
        // Nudge udev and let the event queue drain before the next probe
        if let Err(e) = udevadm::trigger().and_then(|()| udevadm::settle()) {
            warn!("udev settle failed while waiting for '{label}': {e:#}");
        }
        thread::sleep(Duration::from_secs(1));
    }

    Err(CapstanError::new(StorageError::DeviceNotFound {
        label: label.into(),
        retries: max_tries,
    }))
}

/// Resolves a live partition by label, carrying its current mount state.
pub fn resolve_partition(
    label: &str,
    fs: FilesystemKind,
    max_tries: u64,
) -> Result<Partition, CapstanError> {
    let path = get_device_by_label(label, max_tries)?;
    let mount_point = proc_mount_point(&path).structured(StorageError::Inventory)?;
    Ok(Partition {
        label: label.into(),
        name: path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default(),
        disk: PathBuf::new(),
        path,
        size_mib: 0,
        fs,
        flags: vec![],
        mount_point,
    })
}

/// Mounts a partition. Fails if the partition is already mounted.
pub fn mount_partition(
    partition: &mut Partition,
    mount_dir: &Path,
    options: &[String],
) -> Result<(), CapstanError> {
    if partition.is_mounted() {
        return Err(CapstanError::new(StorageError::AlreadyMounted {
            target: partition.label.clone(),
        }));
    }

    mount::ensure_mount_directory(mount_dir).structured(StorageError::Mount {
        target: partition.label.clone(),
    })?;
    mount::mount(&partition.path, mount_dir, partition.fs, options).structured(
        StorageError::Mount {
            target: partition.label.clone(),
        },
    )?;
    partition.mount_point = Some(mount_dir.to_path_buf());
    Ok(())
}

/// Unmounts a partition. A partition that is not mounted is left alone.
pub fn unmount_partition(partition: &mut Partition) -> Result<(), CapstanError> {
    let Some(mount_point) = partition.mount_point.take() else {
        return Ok(());
    };

    // The recorded mountpoint may be stale after an earlier cleanup pass
    let mounted = mount::is_mountpoint(&mount_point).structured(StorageError::Unmount {
        target: partition.label.clone(),
    })?;
    if !mounted {
        return Ok(());
    }

    mount::umount(&mount_point, false).structured(StorageError::Unmount {
        target: partition.label.clone(),
    })
}

/// Makes a partition writable, returning the closer that restores the
/// previous state. Already-writable mounts get a no-op closer.
pub fn mount_rw(partition: &mut Partition, mount_dir: &Path) -> Result<Closer, CapstanError> {
    if let Some(mount_point) = partition.mount_point.clone() {
        let options = mount::options_of(&mount_point)
            .structured(StorageError::Remount {
                target: partition.label.clone(),
            })?
            .unwrap_or_default();

        if options.iter().any(|option| option == "ro") {
            mount::remount(&mount_point, "rw").structured(StorageError::Remount {
                target: partition.label.clone(),
            })?;
            // Restore read-only through a bind remount so sibling mounts of
            // the same device are not flipped along
            return Ok(Box::new(move || mount::remount(&mount_point, "bind,ro")));
        }

        return Ok(Box::new(|| Ok(())));
    }

    mount_partition(partition, mount_dir, &["rw".into()])?;
    let mount_dir = mount_dir.to_path_buf();
    Ok(Box::new(move || mount::umount(&mount_dir, false)))
}

/// Loop-mounts a filesystem image, recording the loop device on the image.
pub fn mount_image(image: &mut Image, mount_dir: &Path) -> Result<(), CapstanError> {
    let file = image
        .file
        .clone()
        .structured(StorageError::LoopAttach {
            file: image.label.clone(),
        })?;

    if image.loop_device.is_some() {
        return Err(CapstanError::new(StorageError::AlreadyMounted {
            target: file.display().to_string(),
        }));
    }

    let loop_device = osutils::losetup::attach(&file).structured(StorageError::LoopAttach {
        file: file.display().to_string(),
    })?;

    mount::ensure_mount_directory(mount_dir)
        .and_then(|()| mount::mount(&loop_device, mount_dir, image.fs, &[]))
        .map_err(|e| {
            // Unbind the fresh loop device before surfacing the mount failure
            if let Err(detach_error) = osutils::losetup::detach(&loop_device) {
                warn!("Failed to detach '{}': {detach_error:#}", loop_device.display());
            }
            e
        })
        .structured(StorageError::Mount {
            target: file.display().to_string(),
        })?;

    image.loop_device = Some(loop_device);
    image.mount_point = Some(mount_dir.to_path_buf());
    Ok(())
}

/// Unmounts a loop-mounted image and releases its loop device.
pub fn unmount_image(image: &mut Image) -> Result<(), CapstanError> {
    let Some(mount_point) = image.mount_point.clone() else {
        if image.loop_device.is_some() {
            // Mounted state and loop device must move together
            return Err(CapstanError::new(StorageError::LoopDeviceMissing {
                file: image.label.clone(),
            }));
        }
        return Ok(());
    };

    let loop_device =
        image
            .loop_device
            .clone()
            .structured(StorageError::LoopDeviceMissing {
                file: image.label.clone(),
            })?;

    mount::umount(&mount_point, false).structured(StorageError::Unmount {
        target: mount_point.display().to_string(),
    })?;
    osutils::losetup::detach(&loop_device).structured(StorageError::LoopDetach {
        device: loop_device.display().to_string(),
    })?;

    image.mount_point = None;
    image.loop_device = None;
    Ok(())
}

/// Unmounts every pre-existing mount of the given partition, including LUKS
/// children, before the partition's content is touched.
pub fn unmount_with_children(partition: &Partition) -> Result<(), CapstanError> {
    let device = lsblk::get(&partition.path).structured(StorageError::Unmount {
        target: partition.label.clone(),
    })?;

    // Children first: a mapper mount holds its parent busy
    let mut mountpoints: Vec<PathBuf> = device
        .all_mountpoints_recursive()
        .into_iter()
        .map(Path::to_path_buf)
        .collect();
    mountpoints.reverse();

    for mount_point in mountpoints {
        debug!("Unmounting '{}'", mount_point.display());
        mount::umount(&mount_point, true).structured(StorageError::Unmount {
            target: mount_point.display().to_string(),
        })?;
    }
    Ok(())
}

/// Convenience for resolving a declared layout against the live system when
/// partitioning is skipped (`no_format`).
pub fn resolve_declared(spec: &InstallSpec) -> Result<Vec<Partition>, CapstanError> {
    let inventory = inventory()?;
    let mut resolved = Vec::with_capacity(spec.partitions.len());
    for declared in &spec.partitions {
        let found = inventory
            .iter()
            .find(|partition| partition.label == declared.label)
            .cloned()
            .map(|mut partition| {
                partition.fs = declared.fs;
                partition.flags = declared.flags.clone();
                partition
            })
            .structured(StorageError::DeviceNotFound {
                label: declared.label.clone(),
                retries: 0,
            })?;
        resolved.push(found);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    use capstan_api::{config::PartitionSpec, error::ErrorKind};

    fn spec(partitions: Vec<PartitionSpec>) -> InstallSpec {
        InstallSpec {
            device: "/dev/sda".into(),
            partitions,
            ..Default::default()
        }
    }

    fn part(label: &str, size_mib: u64, fs: FilesystemKind, flags: Vec<PartitionFlag>) -> PartitionSpec {
        PartitionSpec {
            label: label.into(),
            size_mib,
            fs,
            flags,
        }
    }

    #[test]
    fn test_plan_entries() {
        let entries = plan_entries(&spec(vec![
            part("CAP_ESP", 512, FilesystemKind::Vfat, vec![PartitionFlag::Esp]),
            part("CAP_STATE", 8192, FilesystemKind::Ext4, vec![]),
            part("CAP_PERSIST", 0, FilesystemKind::Ext4, vec![]),
        ]))
        .unwrap();

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].name, "CAP_ESP");
        assert_eq!(entries[0].size_mib, Some(512));
        assert_eq!(entries[2].size_mib, None);
    }

    #[test]
    fn test_plan_entries_rejects_grow_not_last() {
        let error = plan_entries(&spec(vec![
            part("CAP_STATE", 0, FilesystemKind::Ext4, vec![]),
            part("CAP_PERSIST", 1024, FilesystemKind::Ext4, vec![]),
        ]))
        .unwrap_err();
        assert!(matches!(
            error.kind(),
            ErrorKind::InvalidConfig(InvalidConfigError::GrowPartitionNotLast { .. })
        ));
    }

    #[test]
    fn test_plan_entries_enforces_esp_minimum() {
        let error = plan_entries(&spec(vec![part(
            "CAP_ESP",
            64,
            FilesystemKind::Vfat,
            vec![PartitionFlag::Esp],
        )]))
        .unwrap_err();
        assert!(matches!(
            error.kind(),
            ErrorKind::InvalidConfig(InvalidConfigError::EspTooSmall { .. })
        ));
    }

    #[test]
    fn test_probe_filesystem() {
        assert_eq!(probe_filesystem("ext4"), Some(FilesystemKind::Ext4));
        assert_eq!(probe_filesystem("crypto_LUKS"), Some(FilesystemKind::Luks));
        assert_eq!(probe_filesystem("weirdfs"), None);
    }

    #[test]
    fn test_unmount_partition_is_noop_when_unmounted() {
        let mut partition = Partition {
            label: "CAP_OEM".into(),
            name: "sda3".into(),
            path: "/dev/sda3".into(),
            disk: "/dev/sda".into(),
            size_mib: 64,
            fs: FilesystemKind::Ext4,
            flags: vec![],
            mount_point: None,
        };
        unmount_partition(&mut partition).unwrap();

        // A stale recorded mountpoint is cleared without invoking umount
        partition.mount_point = Some("/definitely/not/mounted".into());
        unmount_partition(&mut partition).unwrap();
        assert!(partition.mount_point.is_none());
    }

    #[test]
    fn test_mount_partition_rejects_double_mount() {
        let mut partition = Partition {
            label: "CAP_OEM".into(),
            name: "sda3".into(),
            path: "/dev/sda3".into(),
            disk: "/dev/sda".into(),
            size_mib: 64,
            fs: FilesystemKind::Ext4,
            flags: vec![],
            mount_point: Some("/oem".into()),
        };
        let error = mount_partition(&mut partition, Path::new("/elsewhere"), &[]).unwrap_err();
        assert!(matches!(
            error.kind(),
            ErrorKind::Storage(StorageError::AlreadyMounted { .. })
        ));
    }

    #[test]
    fn test_unmount_image_invariants() {
        use capstan_api::config::ImageSource;

        // Unmounted image with no loop device: no-op
        let mut image = Image::new("CAP_ACTIVE", FilesystemKind::Ext4, ImageSource::Dir("/x".into()));
        unmount_image(&mut image).unwrap();

        // Loop device without a mountpoint violates the invariant
        image.loop_device = Some("/dev/loop7".into());
        let error = unmount_image(&mut image).unwrap_err();
        assert!(matches!(
            error.kind(),
            ErrorKind::Storage(StorageError::LoopDeviceMissing { .. })
        ));

        // Mountpoint without a loop device violates it too
        let mut image = Image::new("CAP_ACTIVE", FilesystemKind::Ext4, ImageSource::Dir("/x".into()));
        image.mount_point = Some("/mnt/img".into());
        let error = unmount_image(&mut image).unwrap_err();
        assert!(matches!(
            error.kind(),
            ErrorKind::Storage(StorageError::LoopDeviceMissing { .. })
        ));
    }
}
