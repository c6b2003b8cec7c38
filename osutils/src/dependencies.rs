use std::{
    ffi::{OsStr, OsString},
    os::unix::process::ExitStatusExt,
    path::PathBuf,
    process::{Command as StdCommand, Output, Stdio},
};

use anyhow::{anyhow, bail, Context, Error};
use log::trace;
use strum_macros::IntoStaticStr;

/// Enum of the external tools the agent invokes. Naming them here keeps the
/// call sites abstract and makes the full tool surface auditable in one place.
#[derive(Debug, Clone, Copy, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Dependency {
    Blkid,
    Bootctl,
    Cosign,
    Cryptsetup,
    Dmsetup,
    Losetup,
    Lsblk,
    Lsof,
    Mkfs,
    Mksquashfs,
    Mount,
    Partprobe,
    Rsync,
    Sfdisk,
    Systemctl,
    #[strum(serialize = "systemd-cryptenroll")]
    SystemdCryptenroll,
    #[strum(serialize = "tpm2_nvdefine")]
    Tpm2Nvdefine,
    #[strum(serialize = "tpm2_nvread")]
    Tpm2Nvread,
    #[strum(serialize = "tpm2_nvundefine")]
    Tpm2Nvundefine,
    #[strum(serialize = "tpm2_nvwrite")]
    Tpm2Nvwrite,
    #[strum(serialize = "tpm2_pcrread")]
    Tpm2Pcrread,
    #[strum(serialize = "tpm2_quote")]
    Tpm2Quote,
    Udevadm,
    Umount,
    Wipefs,
    // Test dependencies
    #[cfg(test)]
    Echo,
    #[cfg(test)]
    False,
    #[cfg(test)]
    DoesNotExist,
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.into())
    }
}

impl Dependency {
    /// Gets the name of the dependency, e.g. `Dependency::Sfdisk` => "sfdisk".
    pub fn name(&self) -> &'static str {
        self.into()
    }

    /// Checks if the dependency is present on the system.
    pub fn exists(&self) -> bool {
        self.path().is_ok()
    }

    /// Resolves the dependency binary through $PATH.
    pub fn path(&self) -> Result<PathBuf, Error> {
        which::which(self.name()).context(format!("Failed to find dependency '{}'", self.name()))
    }

    /// Converts the dependency to a new `Command` instance.
    pub fn cmd(&self) -> Command {
        Command {
            dependency: *self,
            args: vec![],
            stdin: None,
        }
    }
}

/// A command invocation under construction. Thin wrapper over
/// `std::process::Command` that resolves the binary through [`Dependency`],
/// traces execution, and checks exit status.
pub struct Command {
    dependency: Dependency,
    args: Vec<OsString>,
    stdin: Option<Vec<u8>>,
}

impl Command {
    pub fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.arg(arg.as_ref());
        }
        self
    }

    /// Feeds the given bytes to the child's stdin. The contents are never
    /// traced, so secrets may pass through here.
    pub fn stdin(&mut self, input: impl Into<Vec<u8>>) -> &mut Self {
        self.stdin = Some(input.into());
        self
    }

    /// Runs the command, failing on a non-zero exit status.
    pub fn run_and_check(&mut self) -> Result<(), Error> {
        self.output().and_then(|output| output.check())
    }

    /// Runs the command and returns stdout, failing on a non-zero exit status.
    pub fn output_and_check(&mut self) -> Result<String, Error> {
        self.output().and_then(|output| output.check_output())
    }

    fn render_command(&self) -> String {
        if self.args.is_empty() {
            self.dependency.to_string()
        } else {
            format!(
                "{} {}",
                self.dependency,
                self.args
                    .iter()
                    .map(|arg| arg.to_string_lossy())
                    .map(|arg| if arg.contains(' ') {
                        format!("'{arg}'")
                    } else {
                        arg.into()
                    })
                    .collect::<Vec<_>>()
                    .join(" "),
            )
        }
    }

    pub fn output(&mut self) -> Result<CommandOutput, Error> {
        let mut cmd = StdCommand::new(self.dependency.path()?);
        cmd.args(&self.args);
        let rendered_command = self.render_command();
        trace!("Executing '{rendered_command}'");

        let output = match self.stdin.take() {
            Some(input) => {
                use std::io::Write;
                cmd.stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped());
                let mut child = cmd
                    .spawn()
                    .context(format!("Failed to execute '{}'", self.dependency))?;
                child
                    .stdin
                    .as_mut()
                    .ok_or_else(|| anyhow!("Child has no stdin handle"))?
                    .write_all(&input)
                    .context(format!("Failed to write to '{}' stdin", self.dependency))?;
                child
                    .wait_with_output()
                    .context(format!("Failed to wait for '{}'", self.dependency))?
            }
            None => cmd
                .output()
                .context(format!("Failed to execute '{}'", self.dependency))?,
        };

        let output = CommandOutput {
            rendered_command,
            inner: output,
        };
        trace!(
            "Executed '{}': {}. Report:\n{}",
            output.rendered_command,
            output.explain_exit(),
            output.output_report(),
        );
        Ok(output)
    }
}

/// Output of a finished command, with its rendered command line for error
/// reporting.
#[derive(Debug)]
pub struct CommandOutput {
    rendered_command: String,
    inner: Output,
}

impl CommandOutput {
    /// Checks if the process exited successfully.
    pub fn success(&self) -> bool {
        self.inner.status.success()
    }

    /// Gets the exit code of the process, if it exited normally.
    pub fn code(&self) -> Option<i32> {
        self.inner.status.code()
    }

    fn signal(&self) -> Option<i32> {
        self.inner.status.signal()
    }

    /// Gets stderr.
    pub fn error_output(&self) -> String {
        String::from_utf8_lossy(&self.inner.stderr).into()
    }

    /// Gets stdout.
    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.inner.stdout).into()
    }

    /// Gets all available output, useful for reporting or debugging.
    pub fn output_report(&self) -> String {
        let stdout = self.output();
        let stderr = self.error_output();

        let mut res = String::with_capacity(stdout.len() + stderr.len() + 20);

        if !stdout.is_empty() {
            res += &format!("stdout:\n{stdout}\n");
        }

        if !stderr.is_empty() {
            if !res.is_empty() {
                res += "\n";
            }
            res += &format!("stderr:\n{stderr}\n");
        }

        res
    }

    /// Checks if the process exited successfully, otherwise produces an error.
    pub fn check(&self) -> Result<(), Error> {
        if self.success() {
            return Ok(());
        }

        Err(match self.output_report() {
            s if !s.is_empty() => anyhow!("Process output:\n{s}"),
            _ => anyhow!("(No output was captured)"),
        }
        .context(format!(
            "Command '{}' {}",
            self.rendered_command,
            self.explain_exit()
        )))
    }

    /// Checks if the process exited successfully and returns stdout, otherwise
    /// produces an error with the output.
    pub fn check_output(&self) -> Result<String, Error> {
        self.check()?;
        Ok(self.output())
    }

    fn explain_exit(&self) -> String {
        if let Some(code) = self.code() {
            format!("exited with status: {code}")
        } else if let Some(signal) = self.signal() {
            format!("was terminated by signal: {signal}")
        } else {
            "exited with unknown status".into()
        }
    }
}

/// Fails unless every listed dependency resolves through $PATH.
pub fn check_all(dependencies: &[Dependency]) -> Result<(), Error> {
    let missing: Vec<&str> = dependencies
        .iter()
        .filter(|dep| !dep.exists())
        .map(|dep| dep.name())
        .collect();
    if !missing.is_empty() {
        bail!("Missing required tools: {}", missing.join(", "));
    }
    Ok(())
}
