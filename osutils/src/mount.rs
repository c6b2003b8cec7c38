use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Error};
use log::error;

use sysdefs::filesystems::FilesystemKind;

use crate::{dependencies::Dependency, files, lsof};

/// Mounts a file or block device at `mount_dir`.
pub fn mount(
    path: impl AsRef<Path>,
    mount_dir: impl AsRef<Path>,
    filesystem: FilesystemKind,
    options: &[String],
) -> Result<(), Error> {
    let mut options = options.to_owned();
    let mut command = Dependency::Mount.cmd();

    // Regular files need a loop device behind the mount
    if path.as_ref().is_file() {
        options.push("loop".into());
    }

    if !options.is_empty() {
        command.arg("-o").arg(options.join(","));
    }

    command
        .arg("-t")
        .arg(filesystem.mount_name())
        .arg(path.as_ref())
        .arg(mount_dir.as_ref())
        .run_and_check()
        .context(format!(
            "Failed to mount {} to path {}",
            path.as_ref().display(),
            mount_dir.as_ref().display(),
        ))?;

    Ok(())
}

/// Unmounts the given directory.
pub fn umount(mount_dir: impl AsRef<Path>, recursive: bool) -> Result<(), Error> {
    let mut cmd = Dependency::Umount.cmd();
    if recursive {
        cmd.arg("-R");
    }

    if let Err(e) = cmd.arg(mount_dir.as_ref()).run_and_check() {
        // Best effort to log open files while ignoring failures, such as a
        // missing lsof binary
        if let Ok(open_files) = lsof::run(mount_dir.as_ref()) {
            if !open_files.is_empty() {
                error!("Processes holding the mount open: {:?}", open_files);
            }
        }

        // Propagate the original unmount error
        return Err(e.context(format!(
            "Failed to unmount directory {}",
            mount_dir.as_ref().display()
        )));
    }

    Ok(())
}

/// Remounts an already-mounted directory with the given option (`ro`/`rw`).
pub fn remount(mount_dir: impl AsRef<Path>, option: &str) -> Result<(), Error> {
    Dependency::Mount
        .cmd()
        .arg("-o")
        .arg(format!("remount,{option}"))
        .arg(mount_dir.as_ref())
        .run_and_check()
        .context(format!(
            "Failed to remount {} as {option}",
            mount_dir.as_ref().display()
        ))
}

/// Checks whether anything is mounted at the given path by scanning
/// /proc/mounts.
pub fn is_mountpoint(path: impl AsRef<Path>) -> Result<bool, Error> {
    let mounts = fs::read_to_string("/proc/mounts").context("Failed to read /proc/mounts")?;
    let needle = path.as_ref().to_string_lossy();
    Ok(mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|mount_point| mount_point == needle))
}

/// Returns the mount options /proc/mounts reports for the given mountpoint,
/// or None when it is not mounted.
pub fn options_of(path: impl AsRef<Path>) -> Result<Option<Vec<String>>, Error> {
    let mounts = fs::read_to_string("/proc/mounts").context("Failed to read /proc/mounts")?;
    let needle = path.as_ref().to_string_lossy();
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let (Some(_device), Some(mount_point), Some(_fstype), Some(options)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if mount_point == needle {
            return Ok(Some(options.split(',').map(String::from).collect()));
        }
    }
    Ok(None)
}

/// Ensures that the target path is a suitable mount point.
pub fn ensure_mount_directory(target_path: &Path) -> Result<(), Error> {
    if target_path.exists() {
        if !target_path.is_dir() {
            bail!("Mount path '{}' is not a directory", target_path.display());
        }
    } else {
        files::create_dirs(target_path).context(format!(
            "Failed to create mount path '{}'",
            target_path.display()
        ))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs::File;

    use tempfile::TempDir;

    #[test]
    fn test_ensure_mount_directory() {
        let temp_mount_dir = TempDir::new().unwrap();

        // An existing directory is fine
        ensure_mount_directory(temp_mount_dir.path()).unwrap();

        // A missing directory is created
        let temp_mount_point_dir = temp_mount_dir.path().join("temp_dir");
        ensure_mount_directory(&temp_mount_point_dir).unwrap();
        assert!(temp_mount_point_dir.exists());

        // A file path does not work
        let temp_mount_point_file = temp_mount_dir.path().join("temp_file");
        File::create(&temp_mount_point_file).unwrap();
        assert_eq!(
            ensure_mount_directory(&temp_mount_point_file)
                .unwrap_err()
                .to_string(),
            format!(
                "Mount path '{}' is not a directory",
                temp_mount_point_file.display()
            )
        );
    }

    #[test]
    fn test_is_mountpoint() {
        // The root filesystem is always mounted; a fresh tempdir never is.
        assert!(is_mountpoint("/").unwrap());
        let temp_dir = TempDir::new().unwrap();
        assert!(!is_mountpoint(temp_dir.path()).unwrap());
    }

    #[test]
    fn test_options_of() {
        let options = options_of("/").unwrap().unwrap();
        assert!(!options.is_empty());
        assert!(options_of(TempDir::new().unwrap().path()).unwrap().is_none());
    }
}
