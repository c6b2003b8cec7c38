use std::{collections::BTreeMap, fs, path::Path};

use anyhow::{bail, Context, Error};

/// A grub environment block is exactly this many bytes on disk, padded with
/// `#` so in-place edits by grub itself never change the file size.
pub const ENV_BLOCK_SIZE: usize = 1024;

const HEADER: &str = "# GRUB Environment Block\n";

/// Parses `key=value` lines from an environment block, skipping comments.
pub fn read_variables(env_file: impl AsRef<Path>) -> Result<BTreeMap<String, String>, Error> {
    let content = fs::read_to_string(env_file.as_ref()).context(format!(
        "Failed to read grub environment block '{}'",
        env_file.as_ref().display()
    ))?;

    Ok(parse(&content))
}

fn parse(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// Reads the existing variables, overrides the given keys, and rewrites the
/// block padded to its fixed size. Keys are emitted in sorted order.
pub fn set_variables(
    env_file: impl AsRef<Path>,
    overrides: &BTreeMap<String, String>,
) -> Result<(), Error> {
    let mut variables = if env_file.as_ref().exists() {
        read_variables(env_file.as_ref())?
    } else {
        BTreeMap::new()
    };
    variables.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));

    let rendered = render(&variables)?;
    fs::write(env_file.as_ref(), rendered).context(format!(
        "Failed to write grub environment block '{}'",
        env_file.as_ref().display()
    ))
}

fn render(variables: &BTreeMap<String, String>) -> Result<Vec<u8>, Error> {
    let mut block = String::with_capacity(ENV_BLOCK_SIZE);
    block.push_str(HEADER);
    for (key, value) in variables {
        if key.contains(['=', '\n']) || value.contains('\n') {
            bail!("Variable '{key}' cannot be stored in an environment block");
        }
        block.push_str(key);
        block.push('=');
        block.push_str(value);
        block.push('\n');
    }

    if block.len() > ENV_BLOCK_SIZE {
        bail!(
            "Environment block overflows its {} byte size by {} bytes",
            ENV_BLOCK_SIZE,
            block.len() - ENV_BLOCK_SIZE
        );
    }

    let mut bytes = block.into_bytes();
    bytes.resize(ENV_BLOCK_SIZE, b'#');
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let env_file = temp_dir.path().join("grubenv");

        let variables = vars(&[
            ("next_entry", "statereset"),
            ("default", "active"),
            ("boot_assessment", "yes"),
        ]);
        set_variables(&env_file, &variables).unwrap();

        assert_eq!(read_variables(&env_file).unwrap(), variables);

        // The block is exactly its fixed size, padded with '#'
        let raw = fs::read(&env_file).unwrap();
        assert_eq!(raw.len(), ENV_BLOCK_SIZE);
        assert!(raw.ends_with(b"#"));
    }

    #[test]
    fn test_keys_emitted_sorted() {
        let temp_dir = TempDir::new().unwrap();
        let env_file = temp_dir.path().join("grubenv");

        set_variables(&env_file, &vars(&[("zeta", "1"), ("alpha", "2")])).unwrap();
        let content = fs::read_to_string(&env_file).unwrap();
        let alpha = content.find("alpha=2").unwrap();
        let zeta = content.find("zeta=1").unwrap();
        assert!(alpha < zeta);
    }

    #[test]
    fn test_override_preserves_other_keys() {
        let temp_dir = TempDir::new().unwrap();
        let env_file = temp_dir.path().join("grubenv");

        set_variables(&env_file, &vars(&[("default", "active"), ("tries", "3")])).unwrap();
        set_variables(&env_file, &vars(&[("default", "passive")])).unwrap();

        assert_eq!(
            read_variables(&env_file).unwrap(),
            vars(&[("default", "passive"), ("tries", "3")])
        );
    }

    #[test]
    fn test_parse_skips_comments() {
        let parsed = parse("# GRUB Environment Block\nkey=value\n####\nother=x=y\n");
        assert_eq!(parsed["key"], "value");
        // Everything after the first '=' is the value, verbatim
        assert_eq!(parsed["other"], "x=y");
    }

    #[test]
    fn test_overflow_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let env_file = temp_dir.path().join("grubenv");

        let result = set_variables(&env_file, &vars(&[("big", &"x".repeat(2048))]));
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("overflows its 1024 byte size"));
    }

    #[test]
    fn test_invalid_keys_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let env_file = temp_dir.path().join("grubenv");

        set_variables(&env_file, &vars(&[("bad=key", "v")])).unwrap_err();
        set_variables(&env_file, &vars(&[("key", "multi\nline")])).unwrap_err();
    }
}
