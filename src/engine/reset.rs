use std::{fs, path::Path};

use log::{info, warn};

use capstan_api::{
    config::{BootloaderVariant, Config, ResetSpec},
    constants::{
        ESP_MOUNT_POINT_PATH, IMAGES_DIR, LABEL_ESP, LABEL_OEM, LABEL_PERSISTENT, LABEL_RECOVERY,
        LABEL_STATE, TARGET_MOUNT_ROOT,
    },
    error::{CapstanError, InvalidConfigError, ReportError, ServicingError, StorageError},
};
use osutils::dependencies::Dependency;
use sysdefs::filesystems::FilesystemKind;

use super::{
    boot::{entries, grub, Role},
    cleanup::CleanupStack,
    hooks::{self, HookPoint},
    storage::{deploy, partitioning},
    EngineContext,
};

const RESOLVE_RETRIES: u64 = 5;

/// Resets persistent state and reseeds the active slot from recovery.
pub fn run(config: &Config) -> Result<(), CapstanError> {
    let spec = config
        .reset
        .clone()
        .structured(InvalidConfigError::MissingSpec { action: "reset" })?;

    info!("Starting state reset");
    let ctx = EngineContext::new(config);
    let mut cleanup = CleanupStack::new();
    let result = execute(&ctx, &spec, &mut cleanup);
    super::finish(cleanup, result)?;
    info!("Reset finished");

    if spec.reboot {
        info!("Rebooting");
        Dependency::Systemctl
            .cmd()
            .arg("reboot")
            .run_and_check()
            .structured(ServicingError::Reboot)?;
    }
    Ok(())
}

fn execute(
    ctx: &EngineContext,
    spec: &ResetSpec,
    cleanup: &mut CleanupStack,
) -> Result<(), CapstanError> {
    hooks::dispatch(&ctx.config, HookPoint::BeforeReset, Path::new("/"))?;

    // Everything the reset touches must be quiesced first
    for label in [LABEL_PERSISTENT, LABEL_OEM] {
        match partitioning::resolve_partition(label, FilesystemKind::Ext4, 1) {
            Ok(partition) => partitioning::unmount_with_children(&partition)?,
            Err(e) => warn!("Partition '{label}' not present, skipping unmount: {e:?}"),
        }
    }

    if spec.format_persistent {
        let persistent =
            partitioning::resolve_partition(LABEL_PERSISTENT, FilesystemKind::Ext4, RESOLVE_RETRIES)?;
        partitioning::format_partition(&persistent.path, persistent.fs, LABEL_PERSISTENT)?;
    }
    if spec.format_oem {
        let oem = partitioning::resolve_partition(LABEL_OEM, FilesystemKind::Ext4, RESOLVE_RETRIES)?;
        partitioning::format_partition(&oem.path, oem.fs, LABEL_OEM)?;
    }

    match ctx.config.bootloader {
        BootloaderVariant::Unified => reset_unified(ctx, spec, cleanup)?,
        BootloaderVariant::Grub => reset_legacy(ctx, spec, cleanup)?,
    }

    // OEM carries the first-boot configuration; leave it reachable
    let mut oem = partitioning::resolve_partition(LABEL_OEM, FilesystemKind::Ext4, RESOLVE_RETRIES)?;
    if !oem.is_mounted() {
        let oem_mount = Path::new(TARGET_MOUNT_ROOT).join("oem");
        partitioning::mount_partition(&mut oem, &oem_mount, &[])?;
        cleanup.push("unmount OEM", move || {
            osutils::mount::umount(&oem_mount, false)
        });
    }

    hooks::dispatch(&ctx.config, HookPoint::AfterReset, Path::new("/"))?;
    Ok(())
}

fn reset_unified(
    ctx: &EngineContext,
    spec: &ResetSpec,
    cleanup: &mut CleanupStack,
) -> Result<(), CapstanError> {
    let mut esp = partitioning::resolve_partition(LABEL_ESP, FilesystemKind::Vfat, RESOLVE_RETRIES)?;
    let closer = partitioning::mount_rw(&mut esp, Path::new(ESP_MOUNT_POINT_PATH))?;
    cleanup.push("restore ESP mount state", closer);

    let esp_root = esp.mount_point.clone().structured(StorageError::Mount {
        target: esp.label.clone(),
    })?;

    match &spec.source {
        // An explicit artefact reseeds active through the staging role
        Some(source) => {
            deploy::dump_source(source, &esp_root, ctx.config.verify.as_ref(), false).structured(
                ServicingError::Deploy {
                    slot: "unassigned".into(),
                },
            )?;
            entries::rotate(&esp_root, Role::Unassigned, Role::Active)?;
            entries::drop_role(&esp_root, "unassigned")?;
        }
        // Default: active is reseeded from the recovery slot on disk
        None => {
            entries::rotate(&esp_root, Role::Recovery, Role::Active)?;
        }
    }

    let entries_dir = ctx.entries_dir(&esp_root);
    let loader_conf = ctx.loader_conf(&esp_root);
    entries::add_boot_assessment(&entries_dir)?;
    entries::select_default(&entries_dir, &loader_conf, "active")?;
    Ok(())
}

fn reset_legacy(
    ctx: &EngineContext,
    spec: &ResetSpec,
    cleanup: &mut CleanupStack,
) -> Result<(), CapstanError> {
    let mut state =
        partitioning::resolve_partition(LABEL_STATE, FilesystemKind::Ext4, RESOLVE_RETRIES)?;
    let closer =
        partitioning::mount_rw(&mut state, &Path::new(TARGET_MOUNT_ROOT).join("state"))?;
    cleanup.push("restore state mount", closer);
    let state_mount = state.mount_point.clone().structured(StorageError::Mount {
        target: state.label.clone(),
    })?;

    let active_path = state_mount.join(IMAGES_DIR).join("active.img");

    match &spec.source {
        Some(source) => {
            let mut image = super::storage::Image::new(
                capstan_api::constants::LABEL_ACTIVE,
                FilesystemKind::Ext4,
                source.clone(),
            )
            .with_file(&active_path, capstan_api::constants::DEFAULT_IMAGE_SIZE_MIB);
            deploy::deploy(&mut image, false, true, ctx.config.verify.as_ref())?;
        }
        None => {
            // Seed active from the recovery image on disk
            let mut recovery =
                partitioning::resolve_partition(LABEL_RECOVERY, FilesystemKind::Ext4, RESOLVE_RETRIES)?;
            let closer = partitioning::mount_rw(
                &mut recovery,
                &Path::new(TARGET_MOUNT_ROOT).join("recovery"),
            )?;
            cleanup.push("restore recovery mount", closer);
            let recovery_mount = recovery
                .mount_point
                .clone()
                .structured(StorageError::Mount {
                    target: recovery.label.clone(),
                })?;

            fs::copy(
                recovery_mount.join(IMAGES_DIR).join("recovery.img"),
                &active_path,
            )
            .structured(ServicingError::Deploy {
                slot: "active".into(),
            })?;
        }
    }

    grub::set_default_entry(&state_mount.join("grub2/grubenv"), "active")
}
