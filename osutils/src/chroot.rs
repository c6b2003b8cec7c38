use std::{
    fs,
    os::{
        fd::{IntoRawFd, RawFd},
        unix,
    },
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Error};
use log::{info, warn};
use sys_mount::{Mount, MountFlags, Unmount, UnmountFlags};

use crate::path::join_relative;

/// Special paths bound into every chroot.
const DEFAULT_BINDS: &[&str] = &["/dev", "/dev/pts", "/proc", "/sys"];

/// Bound additionally when systemd is running on the host, so journald keeps
/// receiving logs from inside the chroot.
const JOURNAL_SOCKET_DIR: &str = "/run/systemd/journal";

/// A chroot environment over a mounted target tree.
///
/// `prepare` binds the default special paths plus any caller-supplied binds;
/// `run_callback` enters the chroot, invokes the callback, and restores the
/// previous root and working directory on every exit path.
pub struct Chroot {
    root: PathBuf,
    extra_binds: Vec<(PathBuf, PathBuf)>,
    mounts: Vec<Mount>,
    active: bool,
}

impl Chroot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extra_binds: Vec::new(),
            mounts: Vec::new(),
            active: false,
        }
    }

    /// Adds an `outside -> inside` bind mount; `inside` is relative to the
    /// chroot root.
    pub fn with_bind(mut self, outside: impl Into<PathBuf>, inside: impl Into<PathBuf>) -> Self {
        self.extra_binds.push((outside.into(), inside.into()));
        self
    }

    /// Whether `prepare` has run without a matching `cleanup`.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Mounts the default special paths and the caller-supplied binds.
    pub fn prepare(&mut self) -> Result<(), Error> {
        if self.active {
            bail!("Chroot at '{}' is already active", self.root.display());
        }

        let mut binds: Vec<(PathBuf, PathBuf)> = DEFAULT_BINDS
            .iter()
            .map(|path| (PathBuf::from(path), PathBuf::from(path)))
            .collect();
        if Path::new("/run/systemd/system").exists() {
            binds.push((
                PathBuf::from(JOURNAL_SOCKET_DIR),
                PathBuf::from(JOURNAL_SOCKET_DIR),
            ));
        }
        binds.extend(self.extra_binds.iter().cloned());

        for (outside, inside) in binds {
            let target = join_relative(&self.root, &inside);
            fs::create_dir_all(&target).context(format!(
                "Failed to create chroot mount point '{}'",
                target.display()
            ))?;
            let mount = Mount::builder()
                .flags(MountFlags::BIND)
                .mount(&outside, &target)
                .context(format!(
                    "Failed to bind '{}' into the chroot",
                    outside.display()
                ))?;
            self.mounts.push(mount);
        }

        self.active = true;
        Ok(())
    }

    /// Enters the chroot, runs the callback, and restores the previous root
    /// and working directory whether the callback succeeded or failed.
    pub fn run_callback<T>(
        &mut self,
        callback: impl FnOnce() -> Result<T, Error>,
    ) -> Result<T, Error> {
        if !self.active {
            bail!("Chroot at '{}' has not been prepared", self.root.display());
        }

        let saved_cwd = std::env::current_dir().context("Failed to read working directory")?;
        let rootfd: RawFd = fs::File::open("/")
            .context("Failed to open '/'")?
            .into_raw_fd();

        info!("Entering chroot '{}'", self.root.display());
        unix::fs::chroot(&self.root).context("Failed to enter chroot")?;
        std::env::set_current_dir("/")
            .context("Failed to set current directory to be inside chroot")?;

        let result = callback();

        // Restoration runs on both outcomes; the process must not stay
        // rooted inside the target tree.
        nix::unistd::fchdir(rootfd).context("Failed to exit chroot")?;
        unix::fs::chroot(".").context("Failed to restore root")?;
        std::env::set_current_dir(&saved_cwd).context("Failed to restore working directory")?;
        let _ = nix::unistd::close(rootfd);

        result
    }

    /// Unmounts everything prepared, in reverse order.
    pub fn cleanup(&mut self) -> Result<(), Error> {
        while let Some(mount) = self.mounts.pop() {
            mount
                .unmount(UnmountFlags::DETACH)
                .context("Failed to unmount chroot special directory")?;
        }
        self.active = false;
        Ok(())
    }
}

impl Drop for Chroot {
    fn drop(&mut self) {
        if self.active {
            warn!(
                "Chroot at '{}' dropped while active, unmounting",
                self.root.display()
            );
            if let Err(e) = self.cleanup() {
                warn!("Failed to clean up chroot: {e:#}");
            }
        }
    }
}
