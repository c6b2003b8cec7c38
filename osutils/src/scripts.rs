use std::{path::Path, process::Command};

use anyhow::{anyhow, Context, Error};
use log::trace;

/// Runs a script file through the given interpreter.
pub fn run_file(interpreter: impl AsRef<Path>, script: impl AsRef<Path>) -> Result<(), Error> {
    trace!(
        "Running script '{}' with interpreter '{}'",
        script.as_ref().display(),
        interpreter.as_ref().display()
    );
    let output = Command::new(interpreter.as_ref())
        .arg(script.as_ref())
        .output()
        .context(format!(
            "Failed to execute script '{}'",
            script.as_ref().display()
        ))?;

    check(output, &format!("script '{}'", script.as_ref().display()))
}

/// Runs a single command line through the given interpreter (`-c`).
pub fn run_command(interpreter: impl AsRef<Path>, command: &str) -> Result<(), Error> {
    trace!(
        "Running command '{}' with interpreter '{}'",
        command,
        interpreter.as_ref().display()
    );
    let output = Command::new(interpreter.as_ref())
        .arg("-c")
        .arg(command)
        .output()
        .context(format!("Failed to execute command '{command}'"))?;

    check(output, &format!("command '{command}'"))
}

fn check(output: std::process::Output, what: &str) -> Result<(), Error> {
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(match stderr.trim() {
        "" => anyhow!("{what} failed with {}", output.status),
        err => anyhow!("{what} failed with {}: {err}", output.status),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    use tempfile::TempDir;

    #[test]
    fn test_run_command() {
        run_command("/bin/sh", "true").unwrap();
        let error = run_command("/bin/sh", "echo oops >&2; exit 3").unwrap_err();
        assert!(error.to_string().contains("oops"));
    }

    #[test]
    fn test_run_file() {
        let temp_dir = TempDir::new().unwrap();
        let marker = temp_dir.path().join("marker");
        let script = temp_dir.path().join("hook.sh");
        fs::write(&script, format!("touch {}\n", marker.display())).unwrap();

        run_file("/bin/sh", &script).unwrap();
        assert!(marker.exists());
    }
}
