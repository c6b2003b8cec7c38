use anyhow::{Context, Error};

use crate::dependencies::Dependency;

/// Lists the names of active device-mapper targets of the given type, e.g.
/// `crypt`. An empty table makes dmsetup print a single "No devices found"
/// line, which is filtered out here.
pub fn list_targets(target_type: &str) -> Result<Vec<String>, Error> {
    let output = Dependency::Dmsetup
        .cmd()
        .arg("ls")
        .arg("--target")
        .arg(target_type)
        .output_and_check()
        .context("Failed to list device-mapper targets")?;

    Ok(parse_ls_output(&output))
}

fn parse_ls_output(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty() && !line.starts_with("No devices"))
        .filter_map(|line| line.split_whitespace().next())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ls_output() {
        assert_eq!(
            parse_ls_output("cap_persist\t(253:0)\nmydata\t(253:1)\n"),
            vec!["cap_persist".to_string(), "mydata".to_string()]
        );
    }

    #[test]
    fn test_parse_ls_output_empty_table() {
        assert!(parse_ls_output("No devices found\n").is_empty());
        assert!(parse_ls_output("").is_empty());
    }
}
