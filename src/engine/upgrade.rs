use std::{fs, path::Path};

use log::info;

use capstan_api::{
    config::{BootloaderVariant, Config, UpgradeSlot, UpgradeSpec},
    constants::{
        DEFAULT_IMAGE_SIZE_MIB, ESP_MOUNT_POINT_PATH, IMAGES_DIR, LABEL_ACTIVE, LABEL_ESP,
        LABEL_STATE,
    },
    error::{CapstanError, InvalidConfigError, ReportError, ServicingError, StorageError},
};
use sysdefs::filesystems::FilesystemKind;

use super::{
    boot::{entries, grub, Role},
    cleanup::CleanupStack,
    hooks::{self, HookPoint},
    storage::{deploy, partitioning, Image},
    EngineContext,
};

/// Attempts to resolve the partitions an upgrade touches.
const RESOLVE_RETRIES: u64 = 5;

/// Replaces the active or recovery slot with a new artefact, preserving
/// rollback through the A/B rotation.
pub fn run(config: &Config) -> Result<(), CapstanError> {
    let spec = config
        .upgrade
        .clone()
        .structured(InvalidConfigError::MissingSpec { action: "upgrade" })?;

    info!("Starting upgrade of the {:?} slot", spec.slot);
    let ctx = EngineContext::new(config);
    let mut cleanup = CleanupStack::new();
    let result = execute(&ctx, &spec, &mut cleanup);
    super::finish(cleanup, result)?;
    info!("Upgrade finished");
    Ok(())
}

fn execute(
    ctx: &EngineContext,
    spec: &UpgradeSpec,
    cleanup: &mut CleanupStack,
) -> Result<(), CapstanError> {
    hooks::dispatch(&ctx.config, HookPoint::BeforeUpgrade, Path::new("/"))?;

    match ctx.config.bootloader {
        BootloaderVariant::Unified => upgrade_unified(ctx, spec, cleanup)?,
        BootloaderVariant::Grub => upgrade_legacy(ctx, spec, cleanup)?,
    }

    hooks::dispatch(&ctx.config, HookPoint::AfterUpgrade, Path::new("/"))?;
    Ok(())
}

fn upgrade_unified(
    ctx: &EngineContext,
    spec: &UpgradeSpec,
    cleanup: &mut CleanupStack,
) -> Result<(), CapstanError> {
    let source = spec
        .source
        .clone()
        .structured(InvalidConfigError::MissingSpec { action: "upgrade" })?;

    // The ESP is normally mounted read-only on a running system
    let mut esp = partitioning::resolve_partition(LABEL_ESP, FilesystemKind::Vfat, RESOLVE_RETRIES)?;
    let closer = partitioning::mount_rw(&mut esp, Path::new(ESP_MOUNT_POINT_PATH))?;
    cleanup.push("restore ESP mount state", closer);

    let esp_root = esp.mount_point.clone().structured(StorageError::Mount {
        target: esp.label.clone(),
    })?;

    // New artefacts arrive under the `unassigned` staging prefix
    deploy::dump_source(
        &source,
        &esp_root,
        ctx.config.verify.as_ref(),
        !spec.preserve_excludes,
    )
    .structured(ServicingError::Deploy {
        slot: "unassigned".into(),
    })?;

    let entries_dir = ctx.entries_dir(&esp_root);
    let loader_conf = ctx.loader_conf(&esp_root);

    if spec.slot == UpgradeSlot::Recovery {
        // Narrow special case: only the recovery artefacts are replaced
        entries::replace_recovery(&esp_root)?;
        return Ok(());
    }

    entries::rotate(&esp_root, Role::Active, Role::Passive)?;
    entries::rotate(&esp_root, Role::Unassigned, Role::Active)?;
    entries::select_default(&entries_dir, &loader_conf, "active")?;
    entries::drop_role(&esp_root, "unassigned")?;
    entries::add_boot_assessment(&entries_dir)?;

    if let Some(boot_entry) = &spec.boot_entry {
        entries::select_default(&entries_dir, &loader_conf, boot_entry)?;
    }

    Ok(())
}

/// Legacy variant: build the new active image beside the old one, then swap
/// the slot images so the previous active becomes the fallback.
fn upgrade_legacy(
    ctx: &EngineContext,
    spec: &UpgradeSpec,
    cleanup: &mut CleanupStack,
) -> Result<(), CapstanError> {
    let source = spec
        .source
        .clone()
        .structured(InvalidConfigError::MissingSpec { action: "upgrade" })?;

    let mut state =
        partitioning::resolve_partition(LABEL_STATE, FilesystemKind::Ext4, RESOLVE_RETRIES)?;
    let closer = partitioning::mount_rw(
        &mut state,
        &Path::new(capstan_api::constants::TARGET_MOUNT_ROOT).join("state"),
    )?;
    cleanup.push("restore state mount", closer);

    let state_mount = state.mount_point.clone().structured(StorageError::Mount {
        target: state.label.clone(),
    })?;

    // The transition image is built on the partition that will hold it, so
    // the final swap is a same-filesystem rename.
    match spec.slot {
        UpgradeSlot::Recovery => {
            // Recovery upgrades replace only the recovery image
            let mut recovery = partitioning::resolve_partition(
                capstan_api::constants::LABEL_RECOVERY,
                FilesystemKind::Ext4,
                RESOLVE_RETRIES,
            )?;
            let closer = partitioning::mount_rw(
                &mut recovery,
                &Path::new(capstan_api::constants::TARGET_MOUNT_ROOT).join("recovery"),
            )?;
            cleanup.push("restore recovery mount", closer);
            let recovery_mount =
                recovery
                    .mount_point
                    .clone()
                    .structured(StorageError::Mount {
                        target: recovery.label.clone(),
                    })?;

            // The recovery slot boots a squashfs, matching what install lays
            // down; the partition label is what the loader searches for
            let recovery_images = recovery_mount.join(IMAGES_DIR);
            let transition_path = recovery_images.join("transition.img");
            let mut transition = Image::new(
                capstan_api::constants::LABEL_RECOVERY,
                FilesystemKind::Squashfs,
                source,
            )
            .with_file(&transition_path, DEFAULT_IMAGE_SIZE_MIB);
            deploy::deploy(&mut transition, false, true, ctx.config.verify.as_ref())?;

            fs::rename(&transition_path, recovery_images.join("recovery.img")).structured(
                ServicingError::Deploy {
                    slot: "recovery".into(),
                },
            )?;
        }
        UpgradeSlot::Active => {
            let images_dir = state_mount.join(IMAGES_DIR);
            let transition_path = images_dir.join("transition.img");
            let mut transition = Image::new(LABEL_ACTIVE, FilesystemKind::Ext4, source)
                .with_file(&transition_path, DEFAULT_IMAGE_SIZE_MIB);
            deploy::deploy(&mut transition, false, true, ctx.config.verify.as_ref())?;

            // active -> passive, transition -> active; rename is atomic per
            // file, and ordering keeps a bootable image present throughout
            let active_path = images_dir.join("active.img");
            let passive_path = images_dir.join("passive.img");
            if active_path.exists() {
                fs::rename(&active_path, &passive_path).structured(ServicingError::Deploy {
                    slot: "passive".into(),
                })?;
            }
            fs::rename(&transition_path, &active_path).structured(ServicingError::Deploy {
                slot: "active".into(),
            })?;

            let entry = spec.boot_entry.as_deref().unwrap_or("active");
            grub::set_default_entry(&state_mount.join("grub2/grubenv"), entry)?;
        }
    }

    Ok(())
}
