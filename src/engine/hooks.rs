use std::{
    io::Write,
    path::Path,
    process::{Command, Stdio},
};

use anyhow::{Context, Error};
use log::{debug, info, warn};
use strum_macros::Display;

use capstan_api::{
    config::{Config, Stage},
    constants::{DEFAULT_SCRIPT_INTERPRETER, HOOK_SCRIPT_DIR},
    error::{CapstanError, ReportError, ServicingError},
};
use osutils::{files, path::join_relative, scripts};

/// Named hook points the orchestrator exposes. Each dispatch runs the
/// configuration-driven stages, then an optional well-known script, then
/// publishes a best-effort event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum HookPoint {
    BeforeInstall,
    Install,
    AfterInstall,
    BeforeUpgrade,
    AfterUpgrade,
    BeforeReset,
    AfterReset,
}

/// Runs everything registered at a hook point. Stage failures surface only
/// in strict mode; scripts and event delivery are always best-effort unless
/// strict. Hooks never mutate the merged configuration or the cleanup stack.
pub fn dispatch(config: &Config, point: HookPoint, root: &Path) -> Result<(), CapstanError> {
    debug!("Dispatching hook '{point}'");

    let point_name = point.to_string();
    if let Some(stages) = config.stages.get(&point_name) {
        for stage in stages {
            match run_stage(stage) {
                Ok(()) => {}
                Err(e) if config.strict => {
                    return Err(e).structured(ServicingError::StageFailed {
                        stage: stage.name.clone(),
                    });
                }
                Err(e) => warn!("Stage '{}' failed (non-strict): {e:#}", stage.name),
            }
        }
    }

    let script = join_relative(root, HOOK_SCRIPT_DIR).join(format!("{point_name}.sh"));
    if script.is_file() {
        info!("Running hook script '{}'", script.display());
        match scripts::run_file(DEFAULT_SCRIPT_INTERPRETER, &script) {
            Ok(()) => {}
            Err(e) if config.strict => {
                return Err(e).structured(ServicingError::HookFailed { hook: point_name });
            }
            Err(e) => warn!("Hook script failed (non-strict): {e:#}"),
        }
    }

    publish_event(config, point);
    Ok(())
}

/// Runs the stages registered under `<point>-chroot` inside a chroot of the
/// given root, with the default special paths bound. Used while a freshly
/// deployed tree is still mounted.
pub fn dispatch_chrooted(
    config: &Config,
    point: HookPoint,
    root: &Path,
) -> Result<(), CapstanError> {
    let stage_key = format!("{point}-chroot");
    let Some(stages) = config.stages.get(&stage_key) else {
        return Ok(());
    };

    let mut chroot = osutils::chroot::Chroot::new(root);
    if chroot.is_active() {
        return Err(CapstanError::new(ServicingError::ChrootAlreadyActive));
    }
    chroot
        .prepare()
        .structured(ServicingError::ChrootEnter)?;

    let run_all = || -> Result<(), Error> {
        for stage in stages {
            match run_stage(stage) {
                Ok(()) => {}
                Err(e) if config.strict => return Err(e),
                Err(e) => warn!("Chrooted stage '{}' failed (non-strict): {e:#}", stage.name),
            }
        }
        Ok(())
    };

    let result = chroot.run_callback(run_all);
    let cleanup_result = chroot.cleanup();

    result
        .structured(ServicingError::StageFailed { stage: stage_key })?;
    cleanup_result.structured(ServicingError::ChrootExit)
}

/// Applies one declarative stage: write its files, then run its commands.
fn run_stage(stage: &Stage) -> Result<(), Error> {
    debug!("Running stage '{}'", stage.name);

    for file in &stage.files {
        let mode = file
            .permissions
            .as_deref()
            .map(|permissions| u32::from_str_radix(permissions, 8))
            .transpose()
            .context(format!(
                "Invalid permissions on stage file '{}'",
                file.path.display()
            ))?
            .unwrap_or(0o644);
        files::write_file(&file.path, mode, file.content.as_bytes()).context(format!(
            "Failed to write stage file '{}'",
            file.path.display()
        ))?;
    }

    for command in &stage.commands {
        scripts::run_command(DEFAULT_SCRIPT_INTERPRETER, command)
            .context(format!("Stage command failed: '{command}'"))?;
    }

    Ok(())
}

/// Publishes a hook event to the configured notifier. Fire-and-forget: a
/// missing or failing notifier never affects the action.
fn publish_event(config: &Config, point: HookPoint) {
    let Some(notifier) = &config.event_notifier else {
        return;
    };

    let payload = serde_json::json!({
        "event": point.to_string(),
        "strict": config.strict,
    })
    .to_string();

    let delivery = || -> Result<(), Error> {
        let mut child = Command::new(notifier)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to spawn event notifier")?;
        child
            .stdin
            .as_mut()
            .context("Notifier has no stdin")?
            .write_all(payload.as_bytes())
            .context("Failed to write event payload")?;
        child.wait().context("Failed to wait for notifier")?;
        Ok(())
    };

    if let Err(e) = delivery() {
        debug!("Event delivery for '{point}' failed: {e:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    use capstan_api::config::StageFile;
    use tempfile::TempDir;

    fn config_with_stage(point: &str, stage: Stage, strict: bool) -> Config {
        let mut config = Config {
            strict,
            ..Default::default()
        };
        config.stages.insert(point.into(), vec![stage]);
        config
    }

    #[test]
    fn test_hook_point_names() {
        assert_eq!(HookPoint::BeforeInstall.to_string(), "before-install");
        assert_eq!(HookPoint::AfterUpgrade.to_string(), "after-upgrade");
        assert_eq!(HookPoint::AfterReset.to_string(), "after-reset");
    }

    #[test]
    fn test_stage_writes_files_and_runs_commands() {
        let workdir = TempDir::new().unwrap();
        let written = workdir.path().join("layout/motd");
        let touched = workdir.path().join("touched");

        let stage = Stage {
            name: "seed".into(),
            commands: vec![format!("touch {}", touched.display())],
            files: vec![StageFile {
                path: written.clone(),
                content: "welcome\n".into(),
                permissions: Some("0600".into()),
            }],
        };
        run_stage(&stage).unwrap();

        assert_eq!(fs::read_to_string(&written).unwrap(), "welcome\n");
        assert!(touched.exists());
    }

    #[test]
    fn test_strict_mode_surfaces_stage_failures() {
        let stage = Stage {
            name: "broken".into(),
            commands: vec!["exit 7".into()],
            files: vec![],
        };

        let strict = config_with_stage("before-install", stage.clone(), true);
        dispatch(&strict, HookPoint::BeforeInstall, Path::new("/")).unwrap_err();

        let lenient = config_with_stage("before-install", stage, false);
        dispatch(&lenient, HookPoint::BeforeInstall, Path::new("/")).unwrap();
    }

    #[test]
    fn test_hook_script_runs_from_root() {
        let root = TempDir::new().unwrap();
        let script_dir = join_relative(root.path(), HOOK_SCRIPT_DIR);
        fs::create_dir_all(&script_dir).unwrap();
        let marker = root.path().join("marker");
        fs::write(
            script_dir.join("after-install.sh"),
            format!("touch {}\n", marker.display()),
        )
        .unwrap();

        dispatch(&Config::default(), HookPoint::AfterInstall, root.path()).unwrap();
        assert!(marker.exists());
    }

    #[test]
    fn test_event_notifier_receives_payload() {
        let workdir = TempDir::new().unwrap();
        let sink = workdir.path().join("events");
        let notifier = workdir.path().join("notify.sh");
        fs::write(&notifier, format!("#!/bin/sh\ncat > {}\n", sink.display())).unwrap();
        fs::set_permissions(
            &notifier,
            std::os::unix::fs::PermissionsExt::from_mode(0o755),
        )
        .unwrap();

        let config = Config {
            event_notifier: Some(notifier),
            ..Default::default()
        };
        dispatch(&config, HookPoint::BeforeReset, Path::new("/")).unwrap();

        let payload = fs::read_to_string(&sink).unwrap();
        assert!(payload.contains("\"event\":\"before-reset\""));
    }

    #[test]
    fn test_missing_notifier_is_ignored() {
        let config = Config {
            event_notifier: Some("/does/not/exist".into()),
            ..Default::default()
        };
        dispatch(&config, HookPoint::AfterReset, Path::new("/")).unwrap();
    }
}
