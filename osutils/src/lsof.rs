use std::path::Path;

use anyhow::{Context, Error};

use crate::dependencies::Dependency;

/// Lists processes holding files open under the given path. Used for
/// diagnostics when an unmount fails; the caller decides whether a failure
/// here matters.
pub fn run(path: impl AsRef<Path>) -> Result<Vec<String>, Error> {
    let output = Dependency::Lsof
        .cmd()
        .arg("-t") // terse: PIDs only
        .arg(path.as_ref())
        .output()
        .context("Failed to execute lsof")?;

    // lsof exits 1 when nothing holds the path open.
    if !output.success() {
        return Ok(vec![]);
    }

    Ok(output
        .output()
        .lines()
        .map(|line| line.trim().to_owned())
        .filter(|line| !line.is_empty())
        .collect())
}
