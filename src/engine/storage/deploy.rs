use std::{fs, path::Path};

use anyhow::{Context, Error};
use log::{debug, info};

use capstan_api::{
    config::{ImageSource, VerifyConfig},
    error::{CapstanError, ReportError, StorageError},
};
use osutils::{files, mksquashfs, rsync};
use sysdefs::filesystems::FilesystemKind;
use tempfile::TempDir;

use crate::osimage;

use super::{partitioning, Image};

/// Runtime-only paths never carried over when a directory tree is deployed.
/// Anchored patterns match at the transfer root; unanchored ones anywhere.
pub const DEPLOY_EXCLUDES: &[&str] = &["/mnt", "/proc", "/sys", "/dev", "/tmp", "/host", "/run"];

/// Directories guaranteed to exist in a deployed root, with their modes.
const DIR_STRUCTURE: &[(&str, u32)] = &[
    ("sys", 0o555),
    ("proc", 0o555),
    ("dev", 0o755),
    ("tmp", 0o1777),
    ("boot", 0o755),
    ("usr/local", 0o755),
    ("oem", 0o755),
    ("run", 0o755),
];

/// Materialises an image source into a target tree. `delete_excluded` wipes
/// runtime-only paths already present on the target instead of preserving
/// them.
pub fn dump_source(
    source: &ImageSource,
    target: &Path,
    verify: Option<&VerifyConfig>,
    delete_excluded: bool,
) -> Result<(), Error> {
    info!("Deploying '{source}' into '{}'", target.display());
    match source {
        ImageSource::Dir(dir) => rsync::sync(dir, target, DEPLOY_EXCLUDES, delete_excluded),
        _ => osimage::extract(source, target, verify),
    }
}

/// Copies an image source into its target.
///
/// Without a backing `file`, the image's mountpoint must refer to an
/// already-mounted partition tree and the payload lands there directly. With
/// one, a loopback filesystem image is produced: squashfs images are built
/// from a scratch extraction, ext-family images are created empty, mounted,
/// and populated.
pub fn deploy(
    image: &mut Image,
    leave_mounted: bool,
    create_dir_structure: bool,
    verify: Option<&VerifyConfig>,
) -> Result<(), CapstanError> {
    match image.file.clone() {
        None => {
            let target = image
                .mount_point
                .clone()
                .structured(StorageError::Mount {
                    target: image.label.clone(),
                })?;
            dump_source(&image.source, &target, verify, false).structured(StorageError::Format {
                node: image.label.clone(),
            })?;
            if create_dir_structure {
                ensure_dir_structure(&target).structured(StorageError::Format {
                    node: image.label.clone(),
                })?;
            }
            Ok(())
        }
        Some(file) => {
            if image.fs == FilesystemKind::Squashfs {
                build_squashfs(image, &file, create_dir_structure, verify)
            } else {
                build_filesystem_image(image, &file, create_dir_structure, verify)?;
                if leave_mounted {
                    let mount_dir = file.with_extension("mnt");
                    partitioning::mount_image(image, &mount_dir)?;
                }
                Ok(())
            }
        }
    }
}

/// Builds a squashfs artefact from a scratch extraction of the source.
/// squashfs carries no volume label; the surrounding partition's label stands
/// in for it.
fn build_squashfs(
    image: &mut Image,
    file: &Path,
    create_dir_structure: bool,
    verify: Option<&VerifyConfig>,
) -> Result<(), CapstanError> {
    let scratch = TempDir::new().structured(StorageError::Format {
        node: image.label.clone(),
    })?;

    dump_source(&image.source, scratch.path(), verify, false).structured(StorageError::Format {
        node: image.label.clone(),
    })?;
    if create_dir_structure {
        ensure_dir_structure(scratch.path()).structured(StorageError::Format {
            node: image.label.clone(),
        })?;
    }

    if let Some(parent) = file.parent() {
        files::create_dirs(parent).structured(StorageError::Format {
            node: image.label.clone(),
        })?;
    }
    mksquashfs::build(scratch.path(), file).structured(StorageError::Format {
        node: file.display().to_string(),
    })
}

/// Creates an empty ext-family image of the declared size, formats and labels
/// it, then populates it through a loop mount.
fn build_filesystem_image(
    image: &mut Image,
    file: &Path,
    create_dir_structure: bool,
    verify: Option<&VerifyConfig>,
) -> Result<(), CapstanError> {
    debug!(
        "Creating {} MiB {} image at '{}'",
        image.size_mib,
        image.fs,
        file.display()
    );

    allocate_file(file, image.size_mib).structured(StorageError::Format {
        node: file.display().to_string(),
    })?;
    partitioning::format_partition(file, image.fs, &image.label)?;

    let mount_dir = file.with_extension("mnt");
    partitioning::mount_image(image, &mount_dir)?;

    let populate = || -> Result<(), CapstanError> {
        let target = image.mount_point.clone().expect("image mounted above");
        dump_source(&image.source, &target, verify, false).structured(StorageError::Format {
            node: image.label.clone(),
        })?;
        if create_dir_structure {
            ensure_dir_structure(&target).structured(StorageError::Format {
                node: image.label.clone(),
            })?;
        }
        Ok(())
    };

    // The loop device must be released even when population fails
    let result = populate();
    let unmount_result = partitioning::unmount_image(image);
    result.and(unmount_result)
}

fn allocate_file(file: &Path, size_mib: u64) -> Result<(), Error> {
    if let Some(parent) = file.parent() {
        files::create_dirs(parent)?;
    }
    let handle = fs::File::create(file)
        .context(format!("Failed to create image file '{}'", file.display()))?;
    handle
        .set_len(size_mib * 1024 * 1024)
        .context(format!("Failed to size image file '{}'", file.display()))
}

/// Ensures the runtime directory skeleton exists under the target root.
pub fn ensure_dir_structure(target: &Path) -> Result<(), Error> {
    for (dir, mode) in DIR_STRUCTURE {
        files::create_dirs_mode(target.join(dir), *mode)
            .context(format!("Failed to create '{dir}' under the target root"))?;
    }
    Ok(())
}
