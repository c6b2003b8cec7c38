use std::path::Path;

use anyhow::{Context, Error};

use crate::dependencies::Dependency;

/// Synchronises `source` into `target`.
///
/// Exclude patterns are passed through verbatim: a pattern with a leading `/`
/// is anchored at the transfer root, an unanchored pattern matches anywhere in
/// the tree. Both forms are accepted on purpose. Excluded paths already on
/// the target survive unless `delete_excluded` is set.
pub fn sync(
    source: impl AsRef<Path>,
    target: impl AsRef<Path>,
    excludes: &[&str],
    delete_excluded: bool,
) -> Result<(), Error> {
    let mut cmd = Dependency::Rsync.cmd();
    cmd.arg("--archive")
        .arg("--acls")
        .arg("--xattrs")
        .arg("--delete");
    if delete_excluded {
        cmd.arg("--delete-excluded");
    }

    for pattern in excludes {
        cmd.arg(format!("--exclude={pattern}"));
    }

    // The trailing slash makes rsync copy the contents, not the directory
    cmd.arg(format!("{}/", source.as_ref().display()))
        .arg(target.as_ref())
        .run_and_check()
        .context(format!(
            "Failed to sync '{}' into '{}'",
            source.as_ref().display(),
            target.as_ref().display()
        ))
}
