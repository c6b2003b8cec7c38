use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use tempfile::TempDir;

use capstan_api::{
    config::{BootloaderVariant, Config, InstallSpec},
    constants::{
        DEFAULT_IMAGE_SIZE_MIB, ESP_MOUNT_POINT_PATH, FAIL_SENTINEL_REL_PATH, IMAGES_DIR,
        LABEL_ACTIVE, LABEL_PASSIVE, LABEL_RECOVERY, MAPPER_DIR, TARGET_MOUNT_ROOT,
    },
    error::{
        CapstanError, CapstanResultExt, InvalidConfigError, ReportError, ServicingError,
        StorageError,
    },
};
use osutils::{
    bootctl,
    dependencies::{self, Dependency},
    files, mount,
    path::join_relative,
};
use sysdefs::filesystems::{FilesystemKind, PartitionFlag};

use super::{
    boot::{entries, grub},
    cleanup::CleanupStack,
    hooks::{self, HookPoint},
    storage::{deploy, encryption::EncryptionStrategy, partitioning, Image, Partition},
    EngineContext,
};

/// Runs a clean install to completion. Irreversible: a failure partway
/// leaves the disk inconsistent and a re-run is the expected remediation.
pub fn run(config: &Config) -> Result<(), CapstanError> {
    let spec = config
        .install
        .clone()
        .structured(InvalidConfigError::MissingSpec { action: "install" })?;
    spec.validate()?;

    // Fail before touching the disk if the tool surface is incomplete
    dependencies::check_all(&[
        Dependency::Blkid,
        Dependency::Lsblk,
        Dependency::Mkfs,
        Dependency::Mount,
        Dependency::Partprobe,
        Dependency::Sfdisk,
        Dependency::Udevadm,
        Dependency::Umount,
        Dependency::Wipefs,
    ])
    .structured(ServicingError::MissingTools)?;

    info!("Starting install to '{}'", spec.device.display());
    let ctx = EngineContext::new(config);
    let mut cleanup = CleanupStack::new();
    let result = execute(&ctx, &spec, &mut cleanup);
    super::finish(cleanup, result)?;
    info!("Install finished");
    Ok(())
}

fn execute(
    ctx: &EngineContext,
    spec: &InstallSpec,
    cleanup: &mut CleanupStack,
) -> Result<(), CapstanError> {
    hooks::dispatch(&ctx.config, HookPoint::BeforeInstall, Path::new("/"))?;

    partitioning::deactivate_device_mappers(&spec.device)?;
    let mut partitions = if spec.no_format {
        debug!("Skipping wipe and partitioning (noFormat)");
        partitioning::resolve_declared(spec)?
    } else {
        partitioning::partition_and_format(spec)?
    };

    let target_root = PathBuf::from(TARGET_MOUNT_ROOT);
    mount_target_partitions(&mut partitions, &target_root, cleanup)?;

    hooks::dispatch(&ctx.config, HookPoint::Install, &target_root)?;
    if join_relative(&target_root, FAIL_SENTINEL_REL_PATH).exists() {
        return Err(CapstanError::new(ServicingError::FailSentinel));
    }

    copy_cloud_config(spec, &partitions, &target_root)?;

    match ctx.config.bootloader {
        BootloaderVariant::Unified => install_unified(ctx, spec, &partitions, &target_root)?,
        BootloaderVariant::Grub => install_legacy(ctx, spec, &partitions, &target_root)?,
    }

    encrypt_requested_partitions(ctx, spec, &partitions)?;

    hooks::dispatch(&ctx.config, HookPoint::AfterInstall, &target_root)?;
    Ok(())
}

/// Mounts every formatted target partition under the scratch tree, pushing
/// the inverse unmount onto the cleanup stack as each mount happens.
fn mount_target_partitions(
    partitions: &mut [Partition],
    target_root: &Path,
    cleanup: &mut CleanupStack,
) -> Result<(), CapstanError> {
    for partition in partitions.iter_mut() {
        if partition.fs == FilesystemKind::Luks {
            continue;
        }

        let mount_dir = if partition.flags.contains(&PartitionFlag::Esp) {
            join_relative(target_root, ESP_MOUNT_POINT_PATH)
        } else {
            target_root.join(partition.label.to_lowercase())
        };

        partitioning::mount_partition(partition, &mount_dir, &[])?;
        let label = partition.label.clone();
        cleanup.push(format!("unmount {label}"), move || {
            mount::umount(&mount_dir, false)
        });
    }
    Ok(())
}

fn find_partition<'a>(
    partitions: &'a [Partition],
    label: &str,
) -> Result<&'a Partition, CapstanError> {
    partitions
        .iter()
        .find(|partition| partition.label == label)
        .structured(StorageError::DeviceNotFound {
            label: label.into(),
            retries: 0,
        })
}

fn esp_partition(partitions: &[Partition]) -> Result<&Partition, CapstanError> {
    partitions
        .iter()
        .find(|partition| partition.flags.contains(&PartitionFlag::Esp))
        .structured(StorageError::DeviceNotFound {
            label: "ESP".into(),
            retries: 0,
        })
}

/// Writes the cloud-config payload into the OEM partition so first boot picks
/// it up.
fn copy_cloud_config(
    spec: &InstallSpec,
    partitions: &[Partition],
    target_root: &Path,
) -> Result<(), CapstanError> {
    let Some(cloud_config) = &spec.cloud_config else {
        return Ok(());
    };

    let oem_mount = partitions
        .iter()
        .find(|partition| partition.label.to_uppercase().contains("OEM"))
        .and_then(|partition| partition.mount_point.clone())
        .unwrap_or_else(|| target_root.join("oem"));

    files::write_file(
        oem_mount.join("cloud-config.yaml"),
        0o600,
        cloud_config.as_bytes(),
    )
    .structured(ServicingError::CopyCloudConfig)
}

/// Unified variant: the payload is a set of boot artefacts staged under the
/// `unassigned` role, materialised into the four standard roles on the ESP.
fn install_unified(
    ctx: &EngineContext,
    spec: &InstallSpec,
    partitions: &[Partition],
    _target_root: &Path,
) -> Result<(), CapstanError> {
    let esp = esp_partition(partitions)?;
    let esp_root = esp.mount_point.clone().structured(StorageError::Mount {
        target: esp.label.clone(),
    })?;

    entries::ensure_esp_dirs(&esp_root, &ctx.vendor_dir()).structured(
        capstan_api::error::BootError::InstallEntries,
    )?;

    let source = spec
        .active
        .as_ref()
        .structured(InvalidConfigError::MissingSpec { action: "install" })?;

    // Stage the payload, then place it on the ESP with the staging prefix
    let scratch = TempDir::new().structured(ServicingError::Deploy {
        slot: "unassigned".into(),
    })?;
    deploy::dump_source(source, scratch.path(), ctx.config.verify.as_ref(), false).structured(
        ServicingError::Deploy {
            slot: "unassigned".into(),
        },
    )?;
    files::copy_recursive(scratch.path(), &esp_root).structured(ServicingError::Deploy {
        slot: "unassigned".into(),
    })?;

    let entries_dir = ctx.entries_dir(&esp_root);
    let loader_conf = ctx.loader_conf(&esp_root);

    entries::filter_entries(&entries_dir, &spec.skip_entries)?;
    entries::materialize_roles(&esp_root)?;

    entries::assign_sort_keys(&entries_dir)?;
    entries::add_boot_assessment(&entries_dir)?;
    entries::select_default(&entries_dir, &loader_conf, "cos")?;

    // Canonicalise image keys where the installed toolchain allows it
    match bootctl::version() {
        Ok(version) => entries::canonicalize_image_keys(&entries_dir, version)?,
        Err(e) => warn!("Could not determine boot tool version: {e:#}"),
    }

    Ok(())
}

/// Legacy variant: slot images live as loopback files in the state and
/// recovery partitions, booted through the chained loader.
fn install_legacy(
    ctx: &EngineContext,
    spec: &InstallSpec,
    partitions: &[Partition],
    _target_root: &Path,
) -> Result<(), CapstanError> {
    let state = find_partition(partitions, capstan_api::constants::LABEL_STATE)?;
    let state_mount = state.mount_point.clone().structured(StorageError::Mount {
        target: state.label.clone(),
    })?;

    let verify = ctx.config.verify.as_ref();

    // Active slot: deployed, left mounted so the loader stage can be found
    let active_source = spec
        .active
        .clone()
        .structured(InvalidConfigError::MissingSpec { action: "install" })?;
    let mut active = Image::new(LABEL_ACTIVE, FilesystemKind::Ext4, active_source)
        .with_file(state_mount.join(IMAGES_DIR).join("active.img"), slot_size(spec));
    deploy::deploy(&mut active, true, true, verify)?;

    let install_result = (|| -> Result<(), CapstanError> {
        let deployed_root = active.mount_point.clone().structured(StorageError::Mount {
            target: active.label.clone(),
        })?;

        let esp = esp_partition(partitions)?;
        let esp_root = esp.mount_point.clone().structured(StorageError::Mount {
            target: esp.label.clone(),
        })?;

        grub::install(
            &deployed_root,
            &state_mount,
            &esp_root,
            &state.label,
            grub::DEFAULT_GRUB_CFG,
            &detect_tty(),
            is_efi_boot(),
        )?;

        grub::set_default_entry(&state_mount.join("grub2/grubenv"), "active")?;

        // Stages registered for the chrooted phase run inside the deployed
        // tree while it is still mounted
        hooks::dispatch_chrooted(&ctx.config, HookPoint::AfterInstall, &deployed_root)
    })();

    let unmount_result = partitioning::unmount_image(&mut active);
    install_result.and(unmount_result)?;

    // Passive slot: a copy of the active image, relabeled
    let passive_source = spec
        .source_for("passive")
        .cloned()
        .structured(InvalidConfigError::MissingSpec { action: "install" })?;
    let mut passive = Image::new(LABEL_PASSIVE, FilesystemKind::Ext4, passive_source)
        .with_file(state_mount.join(IMAGES_DIR).join("passive.img"), slot_size(spec));
    deploy::deploy(&mut passive, false, true, verify)?;

    // Recovery slot: a squashfs in the recovery partition
    let recovery = find_partition(partitions, LABEL_RECOVERY)?;
    let recovery_mount = recovery
        .mount_point
        .clone()
        .structured(StorageError::Mount {
            target: recovery.label.clone(),
        })?;
    let recovery_source = spec
        .source_for("recovery")
        .cloned()
        .structured(InvalidConfigError::MissingSpec { action: "install" })?;
    let mut recovery_image = Image::new(LABEL_RECOVERY, FilesystemKind::Squashfs, recovery_source)
        .with_file(
            recovery_mount.join(IMAGES_DIR).join("recovery.img"),
            slot_size(spec),
        );
    deploy::deploy(&mut recovery_image, false, true, verify)?;

    Ok(())
}

fn slot_size(spec: &InstallSpec) -> u64 {
    // A third of the state partition per slot image is the historical split;
    // the default applies when the layout grows the partition.
    spec.partitions
        .iter()
        .find(|partition| partition.label == capstan_api::constants::LABEL_STATE)
        .map(|partition| partition.size_mib / 3)
        .filter(|size| *size > 0)
        .unwrap_or(DEFAULT_IMAGE_SIZE_MIB)
}

fn detect_tty() -> String {
    std::fs::read_to_string("/sys/class/tty/console/active")
        .ok()
        .and_then(|active| active.split_whitespace().last().map(String::from))
        .unwrap_or_else(|| "tty1".into())
}

fn is_efi_boot() -> bool {
    Path::new("/sys/firmware/efi").exists()
}

/// Encrypts the requested partitions, preserving their deployed content
/// across the re-format: back up while still mounted, encrypt (which
/// unmounts), unlock, restore into the mapper, and close every crypt target
/// through device-mapper enumeration.
fn encrypt_requested_partitions(
    ctx: &EngineContext,
    spec: &InstallSpec,
    partitions: &[Partition],
) -> Result<(), CapstanError> {
    if spec.encrypt_partitions.is_empty() {
        return Ok(());
    }

    // Strategy selection reads the merged configuration, which was scanned
    // before any partition content moved.
    let mut strategy = EncryptionStrategy::select(&ctx.config);
    info!("Using encryption strategy '{}'", strategy.name());
    strategy.validate()?;

    let mut backups: Vec<(Partition, Option<TempDir>)> = Vec::new();
    for label in &spec.encrypt_partitions {
        let partition = find_partition(partitions, label)?.clone();

        let backup = match &partition.mount_point {
            Some(mount_point) if mount_point.exists() => {
                let backup = TempDir::new().structured(StorageError::Format {
                    node: label.clone(),
                })?;
                debug!("Backing up '{label}' content before encryption");
                files::copy_recursive(mount_point, backup.path()).structured(
                    StorageError::Format {
                        node: label.clone(),
                    },
                )?;
                Some(backup)
            }
            _ => None,
        };

        strategy.encrypt(&partition)?;
        backups.push((partition, backup));
    }

    strategy.unlock()?;

    for (partition, backup) in &backups {
        let Some(backup) = backup else { continue };

        let mapper_path = Path::new(MAPPER_DIR).join(partition.mapper_name());
        let restore_mount = PathBuf::from(TARGET_MOUNT_ROOT)
            .join("restore")
            .join(partition.mapper_name());
        mount::ensure_mount_directory(&restore_mount).structured(StorageError::Mount {
            target: partition.label.clone(),
        })?;
        mount::mount(&mapper_path, &restore_mount, partition.fs_after_unlock(), &[]).structured(
            StorageError::Mount {
                target: partition.label.clone(),
            },
        )?;

        let restore = files::copy_recursive(backup.path(), &restore_mount).structured(
            StorageError::Format {
                node: partition.label.clone(),
            },
        );
        let unmount = mount::umount(&restore_mount, false).structured(StorageError::Unmount {
            target: partition.label.clone(),
        });
        restore.and(unmount)?;
    }

    // Lock everything back down by enumerating live crypt targets, never by
    // guessing mapper names from labels
    partitioning::deactivate_device_mappers(&spec.device)
        .message("Failed to close encrypted volumes after provisioning")
}
