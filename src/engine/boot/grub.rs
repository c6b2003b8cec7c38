use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Error};
use log::{debug, info, warn};

use capstan_api::{
    constants::{ESP_FALLBACK_DIR, FALLBACK_EFI},
    error::{BootError, CapstanError, ReportError},
};
use osutils::{files, grubenv};

/// Marker file identifying a usable bootloader stage directory.
const STAGE_MARKER: &str = "modinfo.sh";

/// The stage architecture the chained loader boots through.
const STAGE_ARCH: &str = "i386-pc";

/// EFI modules copied next to the rendered configuration.
const EFI_MODULES: [&str; 3] = ["loopback.mod", "squash4.mod", "xzio.mod"];

/// Candidate names of the signed first-stage loader.
const SHIM_CANDIDATES: [&str; 3] = ["shim.efi", "shimx64.efi", "shim-x64.efi"];

/// Candidate names of the signed second-stage loader.
const GRUB_CANDIDATES: [&str; 3] = ["grub.efi", "grubx64.efi", "grub-x64.efi"];

/// The console the shipped configuration names; replaced by the detected tty.
const DEFAULT_CONSOLE: &str = "console=tty1";

/// Flavor whose EFI loader is built with its own vendor prefix and reads the
/// chained config from there instead of the fallback directory.
const VENDOR_PREFIXED_FLAVOR: &str = "alpine";

/// Menu configuration used when the deployed root ships none of its own.
/// Boots the slot images by label through a loopback device; the environment
/// block steers `next_entry`.
pub const DEFAULT_GRUB_CFG: &str = r#"set timeout=5
set gfxmode=auto
set fallback="0 1 2"

if [ -f (${root})/grub2/grubenv ]; then
    load_env -f (${root})/grub2/grubenv
fi

if [ -n "${next_entry}" ]; then
    set default="${next_entry}"
    set next_entry=
    save_env -f (${root})/grub2/grubenv next_entry
fi

set kernel_args="console=tty1 rd.neednet=0"

menuentry "capstan" --id active {
    search --no-floppy --label --set=img_root CAP_STATE
    loopback loop0 (${img_root})/images/active.img
    linux (loop0)/boot/vmlinuz root=LABEL=CAP_ACTIVE ${kernel_args}
    initrd (loop0)/boot/initrd
}

menuentry "capstan (fallback)" --id passive {
    search --no-floppy --label --set=img_root CAP_STATE
    loopback loop0 (${img_root})/images/passive.img
    linux (loop0)/boot/vmlinuz root=LABEL=CAP_PASSIVE ${kernel_args}
    initrd (loop0)/boot/initrd
}

menuentry "capstan recovery" --id recovery {
    search --no-floppy --label --set=img_root CAP_RECOVERY
    loopback loop0 (${img_root})/images/recovery.img
    linux (loop0)/boot/vmlinuz root=LABEL=CAP_RECOVERY ${kernel_args}
    initrd (loop0)/boot/initrd
}

menuentry "capstan state reset" --id statereset {
    search --no-floppy --label --set=img_root CAP_RECOVERY
    loopback loop0 (${img_root})/images/recovery.img
    linux (loop0)/boot/vmlinuz root=LABEL=CAP_RECOVERY ${kernel_args} capstan.reset
    initrd (loop0)/boot/initrd
}
"#;

/// Installs the legacy chained loader: stage files into the boot directory, a
/// rendered configuration into the state partition, and (on EFI) the signed
/// loaders plus a chained config onto the ESP.
#[allow(clippy::too_many_arguments)]
pub fn install(
    root_dir: &Path,
    boot_dir: &Path,
    esp_dir: &Path,
    state_label: &str,
    cfg: &str,
    tty: &str,
    is_efi: bool,
) -> Result<(), CapstanError> {
    info!("Installing chained bootloader (efi: {is_efi})");

    let stage_dir = locate_stage(root_dir).structured(BootError::StageNotFound {
        root: root_dir.display().to_string(),
    })?;
    debug!("Using stage directory '{}'", stage_dir.display());

    let grub_dir = boot_dir.join("grub2");
    files::copy_recursive(&stage_dir, grub_dir.join(STAGE_ARCH))
        .structured(BootError::InstallChainloader)?;

    fs::write(grub_dir.join("grub.cfg"), render_config(cfg, tty))
        .structured(BootError::InstallChainloader)?;

    if is_efi {
        install_efi(root_dir, &grub_dir, esp_dir, state_label)?;
    }

    Ok(())
}

/// Locates the stage by probing for its marker file under any directory named
/// after the stage architecture.
fn locate_stage(root_dir: &Path) -> Result<PathBuf, Error> {
    files::walk_files(root_dir)
        .find(|path| {
            path.file_name().is_some_and(|name| name == STAGE_MARKER)
                && path
                    .parent()
                    .and_then(|parent| parent.file_name())
                    .is_some_and(|name| name == STAGE_ARCH)
        })
        .and_then(|marker| marker.parent().map(Path::to_path_buf))
        .context(format!(
            "No '{STAGE_ARCH}' stage with '{STAGE_MARKER}' found under '{}'",
            root_dir.display()
        ))
}

/// Substitutes the detected tty into the default-console line.
fn render_config(cfg: &str, tty: &str) -> String {
    cfg.replace(DEFAULT_CONSOLE, &format!("console={tty}"))
}

fn install_efi(
    root_dir: &Path,
    grub_dir: &Path,
    esp_dir: &Path,
    state_label: &str,
) -> Result<(), CapstanError> {
    // Modules and font live next to the rendered config so the loader finds
    // them through its prefix
    copy_efi_modules(root_dir, grub_dir).structured(BootError::InstallChainloader)?;

    let fallback_dir = esp_dir.join(ESP_FALLBACK_DIR);
    files::create_dirs(&fallback_dir).structured(BootError::InstallChainloader)?;

    let shim = find_first(root_dir, &SHIM_CANDIDATES).structured(BootError::StageNotFound {
        root: root_dir.display().to_string(),
    })?;
    fs::copy(&shim, fallback_dir.join(FALLBACK_EFI)).structured(BootError::InstallChainloader)?;

    let grub_efi = find_first(root_dir, &GRUB_CANDIDATES).structured(BootError::StageNotFound {
        root: root_dir.display().to_string(),
    })?;
    fs::copy(&grub_efi, fallback_dir.join("grub.efi"))
        .structured(BootError::InstallChainloader)?;

    // The chained config does nothing but locate the state partition and
    // hand over to the real configuration there
    let chained = chained_config(state_label);
    fs::write(fallback_dir.join("grub.cfg"), &chained)
        .structured(BootError::InstallChainloader)?;

    for mirror in mirror_dirs(root_dir) {
        let mirror_dir = esp_dir.join(mirror);
        files::create_dirs(&mirror_dir).structured(BootError::InstallChainloader)?;
        fs::write(mirror_dir.join("grub.cfg"), &chained)
            .structured(BootError::InstallChainloader)?;
    }

    Ok(())
}

fn copy_efi_modules(root_dir: &Path, grub_dir: &Path) -> Result<(), Error> {
    let efi_module_dir = grub_dir.join("x86_64-efi");
    files::create_dirs(&efi_module_dir)?;

    for module in EFI_MODULES {
        match find_first(root_dir, &[module]) {
            Some(source) => {
                fs::copy(&source, efi_module_dir.join(module))
                    .context(format!("Failed to copy module '{module}'"))?;
            }
            None => warn!("EFI module '{module}' not found in the deployed root"),
        }
    }

    if let Some(font) = find_first(root_dir, &["unicode.pf2"]) {
        let fonts_dir = grub_dir.join("fonts");
        files::create_dirs(&fonts_dir)?;
        fs::copy(&font, fonts_dir.join("unicode.pf2")).context("Failed to copy loader font")?;
    }

    Ok(())
}

fn find_first(root_dir: &Path, candidates: &[&str]) -> Option<PathBuf> {
    files::walk_files(root_dir).find(|path| {
        path.file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| candidates.contains(&name))
    })
}

/// Renders the chained configuration: locate the state partition by label and
/// chain-load the real config from it.
fn chained_config(state_label: &str) -> String {
    format!(
        "search --no-floppy --label --set=root {state_label}\n\
         set prefix=($root)/grub2\n\
         configfile ($root)/grub2/grub.cfg\n"
    )
}

/// ESP directories that need a mirrored chained config in addition to the
/// fallback path. Some flavors build their loader with a vendor prefix and
/// never read the fallback directory.
fn mirror_dirs(root_dir: &Path) -> Vec<PathBuf> {
    match detect_flavor(root_dir) {
        Some(flavor) if flavor == VENDOR_PREFIXED_FLAVOR => {
            vec![Path::new("EFI").join(flavor)]
        }
        _ => vec![],
    }
}

/// Reads the deployed root's os-release ID.
fn detect_flavor(root_dir: &Path) -> Option<String> {
    let content = fs::read_to_string(root_dir.join("etc/os-release")).ok()?;
    content
        .lines()
        .find_map(|line| line.strip_prefix("ID="))
        .map(|id| id.trim_matches('"').to_string())
}

/// Marks the entry the loader boots by default, through the environment
/// block the configuration loads at boot.
pub fn set_default_entry(env_file: &Path, entry: &str) -> Result<(), CapstanError> {
    let mut overrides = BTreeMap::new();
    overrides.insert("next_entry".to_string(), entry.to_string());
    grubenv::set_variables(env_file, &overrides).structured(BootError::GrubEnv {
        path: env_file.display().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    fn seed_stage(root: &Path) {
        let stage = root.join("usr/share/grub2").join(STAGE_ARCH);
        fs::create_dir_all(&stage).unwrap();
        fs::write(stage.join(STAGE_MARKER), "#!/bin/sh\n").unwrap();
        fs::write(stage.join("boot.img"), "stage-bytes").unwrap();
    }

    #[test]
    fn test_locate_stage() {
        let root = TempDir::new().unwrap();
        seed_stage(root.path());
        // A marker outside an i386-pc directory does not count
        fs::create_dir_all(root.path().join("usr/share/other")).unwrap();
        fs::write(
            root.path().join("usr/share/other").join(STAGE_MARKER),
            "",
        )
        .unwrap();

        let stage = locate_stage(root.path()).unwrap();
        assert!(stage.ends_with("usr/share/grub2/i386-pc"));
    }

    #[test]
    fn test_locate_stage_missing() {
        let root = TempDir::new().unwrap();
        locate_stage(root.path()).unwrap_err();
    }

    #[test]
    fn test_render_config_substitutes_console() {
        let cfg = "set kernel_args=\"console=tty1 root=LABEL=CAP_STATE\"\n";
        assert_eq!(
            render_config(cfg, "ttyS0"),
            "set kernel_args=\"console=ttyS0 root=LABEL=CAP_STATE\"\n"
        );
        // Configs without the default console line pass through untouched
        assert_eq!(render_config("set timeout=5\n", "ttyS0"), "set timeout=5\n");
    }

    #[test]
    fn test_chained_config() {
        let chained = chained_config("CAP_STATE");
        assert!(chained.contains("search --no-floppy --label --set=root CAP_STATE"));
        assert!(chained.contains("configfile ($root)/grub2/grub.cfg"));
    }

    #[test]
    fn test_detect_flavor() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("etc")).unwrap();
        fs::write(
            root.path().join("etc/os-release"),
            "NAME=\"Alpine Linux\"\nID=alpine\n",
        )
        .unwrap();
        assert_eq!(detect_flavor(root.path()).as_deref(), Some("alpine"));
        assert_eq!(mirror_dirs(root.path()), vec![PathBuf::from("EFI/alpine")]);

        fs::write(root.path().join("etc/os-release"), "ID=\"opensuse\"\n").unwrap();
        assert_eq!(detect_flavor(root.path()).as_deref(), Some("opensuse"));
        assert!(mirror_dirs(root.path()).is_empty());
    }

    #[test]
    fn test_install_bios_only() {
        let root = TempDir::new().unwrap();
        seed_stage(root.path());
        let boot = TempDir::new().unwrap();
        let esp = TempDir::new().unwrap();

        install(
            root.path(),
            boot.path(),
            esp.path(),
            "CAP_STATE",
            "set kernel_args=\"console=tty1\"\n",
            "ttyS1",
            false,
        )
        .unwrap();

        assert!(boot.path().join("grub2/i386-pc/boot.img").exists());
        let rendered = fs::read_to_string(boot.path().join("grub2/grub.cfg")).unwrap();
        assert!(rendered.contains("console=ttyS1"));
        // No EFI artefacts for a BIOS install
        assert!(!esp.path().join(ESP_FALLBACK_DIR).exists());
    }

    #[test]
    fn test_install_efi() {
        let root = TempDir::new().unwrap();
        seed_stage(root.path());
        let efi_source = root.path().join("usr/share/efi/x86_64");
        fs::create_dir_all(&efi_source).unwrap();
        fs::write(efi_source.join("shim.efi"), "shim-bytes").unwrap();
        fs::write(efi_source.join("grub.efi"), "grub-bytes").unwrap();
        let module_source = root.path().join("usr/share/grub2/x86_64-efi");
        fs::create_dir_all(&module_source).unwrap();
        for module in EFI_MODULES {
            fs::write(module_source.join(module), "module").unwrap();
        }

        let boot = TempDir::new().unwrap();
        let esp = TempDir::new().unwrap();

        install(
            root.path(),
            boot.path(),
            esp.path(),
            "CAP_STATE",
            "set kernel_args=\"console=tty1\"\n",
            "tty1",
            true,
        )
        .unwrap();

        let fallback = esp.path().join(ESP_FALLBACK_DIR);
        assert_eq!(
            fs::read_to_string(fallback.join(FALLBACK_EFI)).unwrap(),
            "shim-bytes"
        );
        assert_eq!(
            fs::read_to_string(fallback.join("grub.efi")).unwrap(),
            "grub-bytes"
        );
        assert!(fs::read_to_string(fallback.join("grub.cfg"))
            .unwrap()
            .contains("CAP_STATE"));
        assert!(boot
            .path()
            .join("grub2/x86_64-efi")
            .join(EFI_MODULES[0])
            .exists());
    }

    #[test]
    fn test_install_efi_mirrors_vendor_prefixed_flavor() {
        let root = TempDir::new().unwrap();
        seed_stage(root.path());
        fs::create_dir_all(root.path().join("etc")).unwrap();
        fs::write(root.path().join("etc/os-release"), "ID=alpine\n").unwrap();
        let efi_source = root.path().join("usr/share/efi");
        fs::create_dir_all(&efi_source).unwrap();
        fs::write(efi_source.join("shimx64.efi"), "shim").unwrap();
        fs::write(efi_source.join("grubx64.efi"), "grub").unwrap();

        let boot = TempDir::new().unwrap();
        let esp = TempDir::new().unwrap();

        install(
            root.path(),
            boot.path(),
            esp.path(),
            "CAP_STATE",
            "",
            "tty1",
            true,
        )
        .unwrap();

        let mirrored = fs::read_to_string(esp.path().join("EFI/alpine/grub.cfg")).unwrap();
        let fallback = fs::read_to_string(esp.path().join(ESP_FALLBACK_DIR).join("grub.cfg")).unwrap();
        assert_eq!(mirrored, fallback);
    }

    #[test]
    fn test_set_default_entry() {
        let dir = TempDir::new().unwrap();
        let env_file = dir.path().join("grubenv");
        set_default_entry(&env_file, "statereset").unwrap();
        let variables = grubenv::read_variables(&env_file).unwrap();
        assert_eq!(variables["next_entry"], "statereset");
    }
}
