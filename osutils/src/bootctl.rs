use anyhow::{Context, Error};
use regex::Regex;

use crate::dependencies::Dependency;

/// Reports the systemd-boot tool version, e.g. 252 from "systemd 252 (252.5)".
pub fn version() -> Result<u64, Error> {
    let output = Dependency::Bootctl
        .cmd()
        .arg("--version")
        .output_and_check()
        .context("Failed to query bootctl version")?;

    parse_version(&output)
}

fn parse_version(output: &str) -> Result<u64, Error> {
    let re = Regex::new(r"systemd (\d+)").expect("static regex");
    re.captures(output)
        .and_then(|captures| captures.get(1))
        .and_then(|version| version.as_str().parse().ok())
        .context("Failed to parse bootctl version output")
}
