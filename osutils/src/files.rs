use std::{
    fs::{self, File},
    os::unix::fs::PermissionsExt,
    path::Path,
};

use anyhow::{Context, Error};

/// Creates a file and all parent directories if they don't exist.
pub fn create_file<S>(path: S) -> Result<File, Error>
where
    S: AsRef<Path>,
{
    if let Some(parent) = path.as_ref().parent() {
        create_dirs(parent)?;
    }

    File::create(path.as_ref()).context(format!(
        "Could not create file: {}",
        path.as_ref().display()
    ))
}

/// Creates all directories in a path if they don't exist.
pub fn create_dirs<S>(path: S) -> Result<(), Error>
where
    S: AsRef<Path>,
{
    fs::create_dir_all(path.as_ref()).context(format!(
        "Could not create path: {}",
        path.as_ref().display()
    ))
}

/// Creates a directory and sets its mode, e.g. sticky 0o1777 for /tmp.
pub fn create_dirs_mode(path: impl AsRef<Path>, mode: u32) -> Result<(), Error> {
    create_dirs(path.as_ref())?;
    fs::set_permissions(path.as_ref(), fs::Permissions::from_mode(mode)).context(format!(
        "Could not set mode {:o} on '{}'",
        mode,
        path.as_ref().display()
    ))
}

/// Writes content to a file with the given mode, creating parents as needed.
pub fn write_file(path: impl AsRef<Path>, mode: u32, content: &[u8]) -> Result<(), Error> {
    create_file(path.as_ref())?;
    fs::write(path.as_ref(), content).context(format!(
        "Could not write file: {}",
        path.as_ref().display()
    ))?;
    fs::set_permissions(path.as_ref(), fs::Permissions::from_mode(mode)).context(format!(
        "Could not set mode {:o} on '{}'",
        mode,
        path.as_ref().display()
    ))
}

/// Reads the content of a file and trims it.
pub fn read_file_trim(file_path: &Path) -> Result<String, Error> {
    let content = fs::read_to_string(file_path)
        .context(format!("Could not read file contents: {:?}", file_path))?;
    Ok(content.trim().to_string())
}

/// Copies a directory tree, preserving file modes.
pub fn copy_recursive(source: impl AsRef<Path>, target: impl AsRef<Path>) -> Result<(), Error> {
    let source = source.as_ref();
    let target = target.as_ref();
    create_dirs(target)?;

    for entry in fs::read_dir(source)
        .context(format!("Could not read directory '{}'", source.display()))?
    {
        let entry = entry.context("Failed to read directory entry")?;
        let entry_target = target.join(entry.file_name());
        let file_type = entry.file_type().context("Failed to read entry type")?;

        if file_type.is_dir() {
            copy_recursive(entry.path(), &entry_target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path()).context("Failed to read symlink")?;
            // Replace an existing link, otherwise symlink() fails with EEXIST
            if entry_target.symlink_metadata().is_ok() {
                fs::remove_file(&entry_target).context("Failed to remove existing link")?;
            }
            std::os::unix::fs::symlink(&link, &entry_target).context(format!(
                "Failed to create symlink '{}'",
                entry_target.display()
            ))?;
        } else {
            fs::copy(entry.path(), &entry_target).context(format!(
                "Failed to copy '{}' to '{}'",
                entry.path().display(),
                entry_target.display()
            ))?;
        }
    }

    Ok(())
}

/// Iterator over all regular files under a directory, yielded lazily in
/// depth-first order. Unreadable subdirectories are skipped.
pub struct WalkFiles {
    stack: Vec<fs::ReadDir>,
}

impl Iterator for WalkFiles {
    type Item = std::path::PathBuf;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(read_dir) = self.stack.last_mut() {
            let Some(entry) = read_dir.next() else {
                self.stack.pop();
                continue;
            };
            let Ok(entry) = entry else {
                continue;
            };
            let path = entry.path();
            match entry.file_type() {
                Ok(file_type) if file_type.is_dir() => {
                    if let Ok(subdir) = fs::read_dir(&path) {
                        self.stack.push(subdir);
                    }
                }
                Ok(_) => return Some(path),
                Err(_) => continue,
            }
        }
        None
    }
}

/// Walks all regular files under `root` without materialising the tree.
pub fn walk_files(root: impl AsRef<Path>) -> WalkFiles {
    WalkFiles {
        stack: fs::read_dir(root.as_ref()).into_iter().collect(),
    }
}
