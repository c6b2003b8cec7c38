use std::path::Path;

use anyhow::{Context, Error};

use crate::dependencies::Dependency;

/// Compression applied to squashfs images. Matches the kernels the agent
/// targets; gzip keeps the widest compatibility.
const COMPRESSION: &str = "gzip";

/// Builds a squashfs image at `destination` from the contents of `source`.
pub fn build(source: impl AsRef<Path>, destination: impl AsRef<Path>) -> Result<(), Error> {
    Dependency::Mksquashfs
        .cmd()
        .arg(source.as_ref())
        .arg(destination.as_ref())
        .arg("-comp")
        .arg(COMPRESSION)
        .arg("-no-progress")
        .arg("-noappend")
        .run_and_check()
        .context(format!(
            "Failed to build squashfs image '{}' from '{}'",
            destination.as_ref().display(),
            source.as_ref().display()
        ))
}
