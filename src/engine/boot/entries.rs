use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Error};
use log::{debug, info};

use capstan_api::{
    constants::{ESP_FALLBACK_DIR, LOADER_ENTRIES_DIR, MIN_BOOT_TOOL_VERSION},
    error::{BootError, CapstanError, ReportError},
};
use osutils::files;

use super::{split_entry_stem, Assessment, BootEntry, Role, STANDARD_ROLES};

/// The staging role name new artefacts arrive under.
const UNASSIGNED: &str = "unassigned";

/// Conf keys that reference a boot image and track role renames.
const IMAGE_KEYS: [&str; 2] = ["efi", "uki"];

/// Parses the loader conf grammar: one `key value` pair per line, the key
/// being the first whitespace-separated token and the value the remainder
/// verbatim. Empty values are permitted; key order is irrelevant.
pub fn parse_conf(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| match line.split_once(' ') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (line.to_string(), String::new()),
        })
        .collect()
}

/// Emits a conf map in deterministic (sorted) key order. Empty values render
/// as `key ` so they survive a round trip.
pub fn emit_conf(conf: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in conf {
        out.push_str(key);
        out.push(' ');
        out.push_str(value);
        out.push('\n');
    }
    out
}

pub fn read_conf(path: &Path) -> Result<BTreeMap<String, String>, Error> {
    let content = fs::read_to_string(path)
        .context(format!("Failed to read conf file '{}'", path.display()))?;
    Ok(parse_conf(&content))
}

pub fn write_conf(path: &Path, conf: &BTreeMap<String, String>) -> Result<(), Error> {
    fs::write(path, emit_conf(conf))
        .context(format!("Failed to write conf file '{}'", path.display()))
}

/// Whether a file name belongs to the given role's artefact set: the role
/// name alone, or the role name followed by a separator.
fn role_prefixed(file_name: &str, role: &str) -> bool {
    match file_name.strip_prefix(role) {
        Some("") => true,
        Some(rest) => rest.starts_with(['.', '+', '_', '-']),
        None => false,
    }
}

fn file_name_of(path: &Path) -> &str {
    path.file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default()
}

/// Collects every artefact under `efi_dir` belonging to the role.
fn role_artefacts(efi_dir: &Path, role: &str) -> Vec<PathBuf> {
    files::walk_files(efi_dir)
        .filter(|path| role_prefixed(file_name_of(path), role))
        .collect()
}

/// Creates the directory skeleton a freshly provisioned ESP needs.
pub fn ensure_esp_dirs(esp_root: &Path, vendor_dir: &Path) -> Result<(), Error> {
    files::create_dirs(esp_root.join(ESP_FALLBACK_DIR))?;
    files::create_dirs(esp_root.join(vendor_dir))?;
    files::create_dirs(esp_root.join(LOADER_ENTRIES_DIR))?;
    Ok(())
}

/// Copies every artefact under `source_root` into `efi_dir`, then
/// materialises the four standard role sets out of the `unassigned` staging
/// set: basenames and `efi`/`uki` conf values get the role name substituted,
/// and the staging set is deleted afterwards.
pub fn install_entries(efi_dir: &Path, source_root: &Path) -> Result<(), CapstanError> {
    files::copy_recursive(source_root, efi_dir).structured(BootError::InstallEntries)?;
    materialize_roles(efi_dir)
}

/// Materialises per-role copies of the staged `unassigned` artefacts.
pub fn materialize_roles(efi_dir: &Path) -> Result<(), CapstanError> {
    let staged: Vec<PathBuf> = files::walk_files(efi_dir)
        .filter(|path| file_name_of(path).contains(UNASSIGNED))
        .collect();

    for role in STANDARD_ROLES {
        let role_name = role.to_string();
        for file in &staged {
            let target = file.with_file_name(file_name_of(file).replace(UNASSIGNED, &role_name));
            debug!("Materialising '{}'", target.display());
            fs::copy(file, &target).structured(BootError::InstallEntries)?;

            if target.extension().is_some_and(|ext| ext == "conf") {
                let mut conf = read_conf(&target).structured(BootError::InstallEntries)?;
                for key in IMAGE_KEYS {
                    if let Some(value) = conf.get_mut(key) {
                        *value = value.replace(UNASSIGNED, &role_name);
                    }
                }
                write_conf(&target, &conf).structured(BootError::InstallEntries)?;
            }
        }
    }

    drop_role(efi_dir, UNASSIGNED)
}

/// Deletes every artefact belonging to the given role name.
pub fn drop_role(efi_dir: &Path, role: &str) -> Result<(), CapstanError> {
    for file in role_artefacts(efi_dir, role) {
        debug!("Removing '{}'", file.display());
        fs::remove_file(&file).structured(BootError::InstallEntries)?;
    }
    Ok(())
}

/// Swaps which image boots under `new_role`: delete the current `new_role`
/// artefact set, then copy the `old_role` set under the new prefix, fixing
/// the image references and the title inside conf files. Delete-then-copy,
/// never overlapping.
pub fn rotate(efi_dir: &Path, old_role: Role, new_role: Role) -> Result<(), CapstanError> {
    let old_name = old_role.to_string();
    let new_name = new_role.to_string();
    info!("Rotating '{old_name}' to '{new_name}'");

    for file in role_artefacts(efi_dir, &new_name) {
        fs::remove_file(&file).structured(BootError::Rotate {
            old_role: old_name.clone(),
            new_role: new_name.clone(),
        })?;
    }

    let sources = role_artefacts(efi_dir, &old_name);
    for file in &sources {
        let rest = file_name_of(file)
            .strip_prefix(&old_name)
            .expect("artefact selected by role prefix");
        let target = file.with_file_name(format!("{new_name}{rest}"));
        fs::copy(file, &target).structured(BootError::Rotate {
            old_role: old_name.clone(),
            new_role: new_name.clone(),
        })?;

        if target.extension().is_some_and(|ext| ext == "conf") {
            let mut conf = read_conf(&target).structured(BootError::Rotate {
                old_role: old_name.clone(),
                new_role: new_name.clone(),
            })?;
            for key in IMAGE_KEYS {
                if let Some(value) = conf.get_mut(key) {
                    *value = value.replace(&old_name, &new_name);
                }
            }
            if let Some(title) = conf.get_mut("title") {
                *title = rewrite_title(title, new_role);
            }
            write_conf(&target, &conf).structured(BootError::Rotate {
                old_role: old_name.clone(),
                new_role: new_name.clone(),
            })?;
        }
    }

    verify_rotation(efi_dir, &old_name, &new_name)
}

/// A rotation must leave the `new_role` set exactly mirroring the `old_role`
/// set; any stale survivor of the deletion pass means the step was partial.
fn verify_rotation(efi_dir: &Path, old_name: &str, new_name: &str) -> Result<(), CapstanError> {
    let expected: Vec<String> = role_artefacts(efi_dir, old_name)
        .iter()
        .map(|file| {
            let rest = file_name_of(file).strip_prefix(old_name).unwrap_or_default();
            format!("{new_name}{rest}")
        })
        .collect();

    for file in role_artefacts(efi_dir, new_name) {
        if !expected.iter().any(|name| name == file_name_of(&file)) {
            return Err(CapstanError::new(BootError::PartialRotation {
                old_role: old_name.into(),
                new_role: new_name.into(),
            }));
        }
    }
    Ok(())
}

/// Maps an entry title to its role-decorated form. Known decorations are
/// stripped first, so repeated application converges.
pub fn rewrite_title(title: &str, new_role: Role) -> String {
    let base = title
        .strip_suffix(" (fallback)")
        .or_else(|| title.strip_suffix(" recovery"))
        .unwrap_or(title);
    match new_role {
        Role::Passive => format!("{base} (fallback)"),
        Role::Recovery => format!("{base} recovery"),
        _ => base.to_string(),
    }
}

/// Entry conf files directly inside the entries directory (the top-level
/// loader config lives elsewhere and is never touched here).
fn entry_conf_files(entries_dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut confs: Vec<PathBuf> = fs::read_dir(entries_dir)
        .context(format!(
            "Failed to read entries directory '{}'",
            entries_dir.display()
        ))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "conf"))
        .collect();
    confs.sort();
    Ok(confs)
}

/// Reads all entries in the directory, marking the loader's default.
pub fn list_entries(
    entries_dir: &Path,
    loader_conf: Option<&Path>,
) -> Result<Vec<BootEntry>, Error> {
    let default = match loader_conf {
        Some(path) if path.exists() => read_conf(path)?.get("default").cloned(),
        _ => None,
    };

    let mut entries = Vec::new();
    for path in entry_conf_files(entries_dir)? {
        let stem = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or_default();
        let (base, assessment) = split_entry_stem(stem);
        let conf = read_conf(&path)?;

        entries.push(BootEntry {
            role: base.parse().unwrap_or(Role::Other),
            base: base.to_string(),
            title: conf.get("title").cloned(),
            image: conf.get("uki").or_else(|| conf.get("efi")).cloned(),
            cmdline: conf.get("cmdline").cloned(),
            sort_key: conf.get("sort-key").cloned(),
            assessment,
            default: default.as_deref() == Some(base),
            path,
        });
    }
    Ok(entries)
}

/// Sets the loader's default to the entry resolved from a logical name.
pub fn select_default(
    entries_dir: &Path,
    loader_conf: &Path,
    logical_name: &str,
) -> Result<(), CapstanError> {
    let name = match Role::resolve_logical(logical_name) {
        Some(role) => role.to_string(),
        // An explicit entry name passes through untouched
        None => logical_name.to_string(),
    };

    let entries = list_entries(entries_dir, None).structured(BootError::SelectDefault {
        name: name.clone(),
    })?;
    if !entries.iter().any(|entry| entry.base == name) {
        return Err(CapstanError::new(BootError::EntryNotFound { role: name }));
    }

    let mut conf = if loader_conf.exists() {
        read_conf(loader_conf).structured(BootError::SelectDefault { name: name.clone() })?
    } else {
        BTreeMap::new()
    };
    conf.insert("default".into(), name.clone());

    if let Some(parent) = loader_conf.parent() {
        files::create_dirs(parent).structured(BootError::SelectDefault { name: name.clone() })?;
    }
    write_conf(loader_conf, &conf).structured(BootError::SelectDefault { name })
}

/// Stamps the canonical sort-key onto every entry file.
pub fn assign_sort_keys(entries_dir: &Path) -> Result<(), CapstanError> {
    for path in entry_conf_files(entries_dir).structured(BootError::AssignSortKeys)? {
        let stem = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or_default();
        let (base, _) = split_entry_stem(stem);
        let role: Role = base.parse().unwrap_or(Role::Other);

        let mut conf = read_conf(&path).structured(BootError::AssignSortKeys)?;
        conf.insert("sort-key".into(), role.sort_key().into());
        write_conf(&path, &conf).structured(BootError::AssignSortKeys)?;
    }
    Ok(())
}

/// Renames every entry file without an assessment suffix to carry the
/// initial counter. Existing counters stay untouched.
pub fn add_boot_assessment(entries_dir: &Path) -> Result<(), CapstanError> {
    for path in entry_conf_files(entries_dir).structured(BootError::BootAssessment)? {
        let stem = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or_default();
        let (_, assessment) = split_entry_stem(stem);
        if assessment.is_some() {
            continue;
        }

        let renamed = path.with_file_name(format!("{stem}{}.conf", Assessment::INITIAL));
        debug!(
            "Adding boot assessment: '{}' -> '{}'",
            path.display(),
            renamed.display()
        );
        fs::rename(&path, &renamed).structured(BootError::BootAssessment)?;
    }
    Ok(())
}

/// Returns the assessment suffix of the single entry resolving to the given
/// logical name. An entry without a suffix reads as no assessment.
pub fn read_assessment(
    entries_dir: &Path,
    logical_name: &str,
) -> Result<Option<Assessment>, CapstanError> {
    let name = match Role::resolve_logical(logical_name) {
        Some(role) => role.to_string(),
        None => logical_name.to_string(),
    };

    let matches: Vec<BootEntry> = list_entries(entries_dir, None)
        .structured(BootError::BootAssessment)?
        .into_iter()
        .filter(|entry| entry.base == name)
        .collect();

    match matches.len() {
        0 => Err(CapstanError::new(BootError::EntryNotFound { role: name })),
        1 => Ok(matches[0].assessment),
        _ => Err(CapstanError::new(BootError::AmbiguousEntry { role: name })),
    }
}

/// Drops entries whose cmdline contains any of the skip strings.
pub fn filter_entries(entries_dir: &Path, skip: &[String]) -> Result<(), CapstanError> {
    if skip.is_empty() {
        return Ok(());
    }

    for entry in list_entries(entries_dir, None).structured(BootError::InstallEntries)? {
        let cmdline = entry.cmdline.as_deref().unwrap_or_default();
        if skip.iter().any(|needle| cmdline.contains(needle)) {
            info!("Dropping boot entry '{}' (cmdline filter)", entry.base);
            fs::remove_file(&entry.path).structured(BootError::InstallEntries)?;
        }
    }
    Ok(())
}

/// Canonicalises image keys to the modern `uki` form when the boot toolchain
/// is new enough. Readers keep accepting both forms; existing `uki` keys are
/// never downgraded.
pub fn canonicalize_image_keys(entries_dir: &Path, tool_version: u64) -> Result<(), CapstanError> {
    if tool_version < MIN_BOOT_TOOL_VERSION {
        return Ok(());
    }

    for path in entry_conf_files(entries_dir).structured(BootError::InstallEntries)? {
        let mut conf = read_conf(&path).structured(BootError::InstallEntries)?;
        if conf.contains_key("uki") {
            continue;
        }
        if let Some(image) = conf.remove("efi") {
            conf.insert("uki".into(), image);
            write_conf(&path, &conf).structured(BootError::InstallEntries)?;
        }
    }
    Ok(())
}

/// Narrow special case for recovery upgrades: copy the staged `unassigned`
/// efi and conf artefacts over the `recovery` set, rewriting role and title,
/// without touching active or passive.
pub fn replace_recovery(efi_dir: &Path) -> Result<(), CapstanError> {
    let recovery = Role::Recovery.to_string();

    let staged: Vec<PathBuf> = role_artefacts(efi_dir, UNASSIGNED)
        .into_iter()
        .filter(|file| {
            file.extension()
                .is_some_and(|ext| ext == "efi" || ext == "conf")
        })
        .collect();

    for file in staged {
        let rest = file_name_of(&file)
            .strip_prefix(UNASSIGNED)
            .expect("artefact selected by role prefix");
        let target = file.with_file_name(format!("{recovery}{rest}"));
        fs::copy(&file, &target).structured(BootError::Rotate {
            old_role: UNASSIGNED.into(),
            new_role: recovery.clone(),
        })?;

        if target.extension().is_some_and(|ext| ext == "conf") {
            let mut conf = read_conf(&target).structured(BootError::Rotate {
                old_role: UNASSIGNED.into(),
                new_role: recovery.clone(),
            })?;
            for key in IMAGE_KEYS {
                if let Some(value) = conf.get_mut(key) {
                    *value = value.replace(UNASSIGNED, &recovery);
                }
            }
            if let Some(title) = conf.get_mut("title") {
                *title = rewrite_title(title, Role::Recovery);
            }
            write_conf(&target, &conf).structured(BootError::Rotate {
                old_role: UNASSIGNED.into(),
                new_role: recovery.clone(),
            })?;
        }
    }

    drop_role(efi_dir, UNASSIGNED)
}

#[cfg(test)]
mod tests {
    use super::*;

    use capstan_api::error::ErrorKind;
    use indoc::indoc;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, content: &str) {
        fs::write(dir.join(name), content).unwrap();
    }

    fn read(dir: &Path, name: &str) -> String {
        fs::read_to_string(dir.join(name)).unwrap()
    }

    fn names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_parse_conf_tolerance() {
        let conf = parse_conf("title My OS\nefi /EFI/capstan/active.efi\n\nempty \n");
        assert_eq!(conf["title"], "My OS");
        assert_eq!(conf["efi"], "/EFI/capstan/active.efi");
        assert_eq!(conf["empty"], "");
        assert_eq!(conf.len(), 3);
    }

    #[test]
    fn test_conf_round_trip() {
        let conf = parse_conf("title My OS\nefi /EFI/capstan/active.efi\nempty \n");
        assert_eq!(parse_conf(&emit_conf(&conf)), conf);

        // Order independence: scrambled input emits deterministically
        let scrambled = parse_conf("sort-key 0001\ntitle My OS\ncmdline console=tty0 rd.debug\n");
        assert_eq!(
            emit_conf(&scrambled),
            "cmdline console=tty0 rd.debug\nsort-key 0001\ntitle My OS\n"
        );
    }

    #[test]
    fn test_role_prefixed() {
        assert!(role_prefixed("active.efi", "active"));
        assert!(role_prefixed("active+3.conf", "active"));
        assert!(role_prefixed("active_v2.img", "active"));
        assert!(role_prefixed("active", "active"));
        assert!(!role_prefixed("activeX.efi", "active"));
        assert!(!role_prefixed("passive.efi", "active"));
    }

    #[test]
    fn test_rewrite_title() {
        assert_eq!(rewrite_title("My OS", Role::Passive), "My OS (fallback)");
        assert_eq!(rewrite_title("My OS (fallback)", Role::Active), "My OS");
        assert_eq!(rewrite_title("My OS recovery", Role::Active), "My OS");
        assert_eq!(rewrite_title("My OS", Role::Recovery), "My OS recovery");

        // Idempotence
        let once = rewrite_title("My OS", Role::Passive);
        assert_eq!(rewrite_title(&once, Role::Passive), once);

        // A base title containing "recovery" mid-string is preserved
        assert_eq!(
            rewrite_title("Recovery OS", Role::Passive),
            "Recovery OS (fallback)"
        );
    }

    #[test]
    fn test_materialize_roles() {
        let efi_dir = TempDir::new().unwrap();
        write(efi_dir.path(), "unassigned.efi", "image-bytes");
        write(
            efi_dir.path(),
            "unassigned.conf",
            "title My OS\nefi /EFI/capstan/unassigned.efi\n",
        );

        materialize_roles(efi_dir.path()).unwrap();

        assert_eq!(
            names(efi_dir.path()),
            vec![
                "active.conf",
                "active.efi",
                "passive.conf",
                "passive.efi",
                "recovery.conf",
                "recovery.efi",
                "statereset.conf",
                "statereset.efi",
            ]
        );
        let conf = parse_conf(&read(efi_dir.path(), "passive.conf"));
        assert_eq!(conf["efi"], "/EFI/capstan/passive.efi");
        // install keeps titles verbatim; decoration happens on rotation
        assert_eq!(conf["title"], "My OS");
    }

    #[test]
    fn test_install_entries_from_source_root() {
        let source = TempDir::new().unwrap();
        fs::create_dir_all(source.path().join("EFI/capstan")).unwrap();
        fs::create_dir_all(source.path().join("loader/entries")).unwrap();
        fs::write(source.path().join("EFI/capstan/unassigned.efi"), "image").unwrap();
        fs::write(
            source.path().join("loader/entries/unassigned.conf"),
            "title My OS\nefi /EFI/capstan/unassigned.efi\n",
        )
        .unwrap();

        let esp = TempDir::new().unwrap();
        install_entries(esp.path(), source.path()).unwrap();

        // Four role sets materialised, staging set gone
        for role in ["active", "passive", "recovery", "statereset"] {
            assert!(esp.path().join(format!("EFI/capstan/{role}.efi")).exists());
            let conf = parse_conf(&fs::read_to_string(
                esp.path().join(format!("loader/entries/{role}.conf")),
            )
            .unwrap());
            assert_eq!(conf["efi"], format!("/EFI/capstan/{role}.efi"));
        }
        assert!(!esp.path().join("EFI/capstan/unassigned.efi").exists());
        assert!(!esp.path().join("loader/entries/unassigned.conf").exists());
    }

    #[test]
    fn test_ab_rotation_on_upgrade() {
        let efi_dir = TempDir::new().unwrap();
        write(efi_dir.path(), "active.efi", "old-active");
        write(
            efi_dir.path(),
            "active.conf",
            "title My OS\nefi /EFI/capstan/active.efi\n",
        );
        write(efi_dir.path(), "passive.efi", "old-passive");
        write(
            efi_dir.path(),
            "passive.conf",
            "title My OS (fallback)\nefi /EFI/capstan/passive.efi\n",
        );
        // New payload staged by the deployer
        write(efi_dir.path(), "unassigned.efi", "new-image");
        write(
            efi_dir.path(),
            "unassigned.conf",
            "title My OS\nefi /EFI/capstan/unassigned.efi\n",
        );

        rotate(efi_dir.path(), Role::Active, Role::Passive).unwrap();
        rotate(efi_dir.path(), Role::Unassigned, Role::Active).unwrap();
        drop_role(efi_dir.path(), "unassigned").unwrap();

        assert_eq!(
            names(efi_dir.path()),
            vec!["active.conf", "active.efi", "passive.conf", "passive.efi"]
        );

        // Active now carries the new image
        assert_eq!(read(efi_dir.path(), "active.efi"), "new-image");
        let active = parse_conf(&read(efi_dir.path(), "active.conf"));
        assert_eq!(active["efi"], "/EFI/capstan/active.efi");
        assert_eq!(active["title"], "My OS");

        // Passive carries the previous active, decorated as fallback
        assert_eq!(read(efi_dir.path(), "passive.efi"), "old-active");
        let passive = parse_conf(&read(efi_dir.path(), "passive.conf"));
        assert_eq!(passive["efi"], "/EFI/capstan/passive.efi");
        assert_eq!(passive["title"], "My OS (fallback)");
    }

    #[test]
    fn test_rotation_is_idempotent() {
        let efi_dir = TempDir::new().unwrap();
        write(efi_dir.path(), "recovery.efi", "recovery-image");
        write(
            efi_dir.path(),
            "recovery.conf",
            "title OS recovery\nefi /EFI/capstan/recovery.efi\n",
        );

        rotate(efi_dir.path(), Role::Recovery, Role::Active).unwrap();
        let first = read(efi_dir.path(), "active.conf");
        rotate(efi_dir.path(), Role::Recovery, Role::Active).unwrap();
        assert_eq!(read(efi_dir.path(), "active.conf"), first);

        let active = parse_conf(&first);
        assert_eq!(active["title"], "OS");
        assert_eq!(active["efi"], "/EFI/capstan/active.efi");
    }

    #[test]
    fn test_select_default() {
        let esp = TempDir::new().unwrap();
        let entries_dir = esp.path().join("loader/entries");
        fs::create_dir_all(&entries_dir).unwrap();
        write(&entries_dir, "active.conf", "title My OS\n");
        write(&entries_dir, "passive.conf", "title My OS (fallback)\n");
        let loader_conf = esp.path().join("loader/loader.conf");
        fs::write(&loader_conf, "timeout 5\n").unwrap();

        select_default(&entries_dir, &loader_conf, "cos").unwrap();
        let conf = parse_conf(&fs::read_to_string(&loader_conf).unwrap());
        assert_eq!(conf["default"], "active");
        assert_eq!(conf["timeout"], "5");

        // `fallback` aliases passive
        select_default(&entries_dir, &loader_conf, "fallback").unwrap();
        let conf = parse_conf(&fs::read_to_string(&loader_conf).unwrap());
        assert_eq!(conf["default"], "passive");

        // At most one default key exists
        assert_eq!(
            fs::read_to_string(&loader_conf)
                .unwrap()
                .matches("default")
                .count(),
            1
        );

        let error = select_default(&entries_dir, &loader_conf, "statereset").unwrap_err();
        assert!(matches!(
            error.kind(),
            ErrorKind::Boot(BootError::EntryNotFound { .. })
        ));
    }

    #[test]
    fn test_assign_sort_keys() {
        let entries_dir = TempDir::new().unwrap();
        write(entries_dir.path(), "active.conf", "title A\n");
        write(entries_dir.path(), "passive+3.conf", "title P\n");
        write(entries_dir.path(), "recovery.conf", "title R\n");
        write(entries_dir.path(), "statereset.conf", "title S\n");
        write(entries_dir.path(), "extra.conf", "title E\n");

        assign_sort_keys(entries_dir.path()).unwrap();

        let key = |name: &str| parse_conf(&read(entries_dir.path(), name))["sort-key"].clone();
        assert_eq!(key("active.conf"), "0001");
        assert_eq!(key("passive+3.conf"), "0002");
        assert_eq!(key("recovery.conf"), "0003");
        assert_eq!(key("statereset.conf"), "0004");
        assert_eq!(key("extra.conf"), "0010");
    }

    #[test]
    fn test_add_boot_assessment() {
        let entries_dir = TempDir::new().unwrap();
        write(entries_dir.path(), "test1.conf", "title 1\n");
        write(entries_dir.path(), "test2+3.conf", "title 2\n");
        write(entries_dir.path(), "test3+1-2.conf", "title 3\n");

        add_boot_assessment(entries_dir.path()).unwrap();

        assert_eq!(
            names(entries_dir.path()),
            vec!["test1+3.conf", "test2+3.conf", "test3+1-2.conf"]
        );
    }

    #[test]
    fn test_read_assessment() {
        let entries_dir = TempDir::new().unwrap();
        write(entries_dir.path(), "active+2-1.conf", "title A\n");
        write(entries_dir.path(), "passive.conf", "title P\n");

        assert_eq!(
            read_assessment(entries_dir.path(), "active").unwrap(),
            Some(Assessment {
                tries_left: 2,
                failures: Some(1)
            })
        );
        // An entry with no suffix reads as no assessment
        assert_eq!(read_assessment(entries_dir.path(), "passive").unwrap(), None);

        let error = read_assessment(entries_dir.path(), "recovery").unwrap_err();
        assert!(matches!(
            error.kind(),
            ErrorKind::Boot(BootError::EntryNotFound { .. })
        ));
    }

    #[test]
    fn test_read_assessment_ambiguous() {
        let entries_dir = TempDir::new().unwrap();
        write(entries_dir.path(), "active+1-2.conf", "title A\n");
        write(entries_dir.path(), "active+3-2.conf", "title A\n");

        let error = read_assessment(entries_dir.path(), "active").unwrap_err();
        assert!(matches!(
            error.kind(),
            ErrorKind::Boot(BootError::AmbiguousEntry { .. })
        ));
    }

    #[test]
    fn test_read_assessment_bogus_suffix() {
        let entries_dir = TempDir::new().unwrap();
        write(entries_dir.path(), "test3+asdasd.conf", "title X\n");
        assert_eq!(read_assessment(entries_dir.path(), "test3").unwrap(), None);
    }

    #[test]
    fn test_read_assessment_anchors_on_last_plus_group() {
        let entries_dir = TempDir::new().unwrap();
        write(entries_dir.path(), "test1++++++5.conf", "title X\n");
        assert_eq!(
            read_assessment(entries_dir.path(), "test1").unwrap(),
            Some(Assessment {
                tries_left: 5,
                failures: None
            })
        );
    }

    #[test]
    fn test_filter_entries() {
        let entries_dir = TempDir::new().unwrap();
        write(
            entries_dir.path(),
            "active.conf",
            "title A\ncmdline console=tty0 root=LABEL=CAP_STATE\n",
        );
        write(
            entries_dir.path(),
            "interactive.conf",
            "title I\ncmdline console=tty0 install-mode\n",
        );

        filter_entries(entries_dir.path(), &["install-mode".into()]).unwrap();
        assert_eq!(names(entries_dir.path()), vec!["active.conf"]);
    }

    #[test]
    fn test_canonicalize_image_keys() {
        let entries_dir = TempDir::new().unwrap();
        write(entries_dir.path(), "active.conf", "efi /EFI/capstan/active.efi\n");
        write(entries_dir.path(), "passive.conf", "uki /EFI/capstan/passive.efi\n");

        // An old toolchain leaves the legacy key in place
        canonicalize_image_keys(entries_dir.path(), MIN_BOOT_TOOL_VERSION - 1).unwrap();
        assert!(parse_conf(&read(entries_dir.path(), "active.conf")).contains_key("efi"));

        canonicalize_image_keys(entries_dir.path(), MIN_BOOT_TOOL_VERSION).unwrap();
        let active = parse_conf(&read(entries_dir.path(), "active.conf"));
        assert_eq!(active["uki"], "/EFI/capstan/active.efi");
        assert!(!active.contains_key("efi"));

        // Existing uki keys are never downgraded
        let passive = parse_conf(&read(entries_dir.path(), "passive.conf"));
        assert_eq!(passive["uki"], "/EFI/capstan/passive.efi");
    }

    #[test]
    fn test_replace_recovery_leaves_ab_untouched() {
        let efi_dir = TempDir::new().unwrap();
        write(efi_dir.path(), "active.efi", "active-image");
        write(
            efi_dir.path(),
            "active.conf",
            "title OS\nefi /EFI/capstan/active.efi\n",
        );
        write(efi_dir.path(), "recovery.efi", "old-recovery");
        write(
            efi_dir.path(),
            "recovery.conf",
            "title OS recovery\nefi /EFI/capstan/recovery.efi\n",
        );
        write(efi_dir.path(), "unassigned.efi", "new-recovery");
        write(
            efi_dir.path(),
            "unassigned.conf",
            "title OS\nefi /EFI/capstan/unassigned.efi\n",
        );

        replace_recovery(efi_dir.path()).unwrap();

        assert_eq!(
            names(efi_dir.path()),
            vec!["active.conf", "active.efi", "recovery.conf", "recovery.efi"]
        );
        assert_eq!(read(efi_dir.path(), "active.efi"), "active-image");
        assert_eq!(read(efi_dir.path(), "recovery.efi"), "new-recovery");
        let recovery = parse_conf(&read(efi_dir.path(), "recovery.conf"));
        assert_eq!(recovery["efi"], "/EFI/capstan/recovery.efi");
        assert_eq!(recovery["title"], "OS recovery");
    }

    #[test]
    fn test_reset_rotation_scenario() {
        let efi_dir = TempDir::new().unwrap();
        write(efi_dir.path(), "active.efi", "worn-active");
        write(
            efi_dir.path(),
            "active.conf",
            "title OS\nefi /EFI/capstan/active.efi\n",
        );
        write(efi_dir.path(), "passive.efi", "passive-image");
        write(
            efi_dir.path(),
            "passive.conf",
            "title OS (fallback)\nefi /EFI/capstan/passive.efi\n",
        );
        write(efi_dir.path(), "recovery.efi", "recovery-image");
        write(
            efi_dir.path(),
            "recovery.conf",
            "title OS recovery\nefi /EFI/capstan/recovery.efi\n",
        );

        rotate(efi_dir.path(), Role::Recovery, Role::Active).unwrap();

        // Active is reseeded from recovery, with the plain title
        assert_eq!(read(efi_dir.path(), "active.efi"), "recovery-image");
        let active = parse_conf(&read(efi_dir.path(), "active.conf"));
        assert_eq!(active["title"], "OS");
        assert_eq!(active["efi"], "/EFI/capstan/active.efi");

        // Passive and recovery are untouched
        assert_eq!(read(efi_dir.path(), "passive.efi"), "passive-image");
        assert_eq!(read(efi_dir.path(), "recovery.efi"), "recovery-image");
        let recovery = parse_conf(&read(efi_dir.path(), "recovery.conf"));
        assert_eq!(recovery["title"], "OS recovery");
    }

    #[test]
    fn test_list_entries_marks_default() {
        let esp = TempDir::new().unwrap();
        let entries_dir = esp.path().join("loader/entries");
        fs::create_dir_all(&entries_dir).unwrap();
        write(&entries_dir, "active+3.conf", "title A\nuki /EFI/capstan/active.efi\n");
        write(&entries_dir, "passive+3.conf", "title P\nefi /EFI/capstan/passive.efi\n");
        let loader_conf = esp.path().join("loader/loader.conf");
        fs::write(&loader_conf, "default active\n").unwrap();

        let entries = list_entries(&entries_dir, Some(&loader_conf)).unwrap();
        assert_eq!(entries.len(), 2);

        let active = entries.iter().find(|entry| entry.base == "active").unwrap();
        assert!(active.default);
        assert_eq!(active.role, Role::Active);
        assert_eq!(active.image.as_deref(), Some("/EFI/capstan/active.efi"));
        assert_eq!(active.assessment, Some(Assessment::INITIAL));

        let passive = entries.iter().find(|entry| entry.base == "passive").unwrap();
        assert!(!passive.default);
        assert_eq!(passive.image.as_deref(), Some("/EFI/capstan/passive.efi"));
    }

    #[test]
    fn test_ensure_esp_dirs() {
        let esp = TempDir::new().unwrap();
        ensure_esp_dirs(esp.path(), Path::new("EFI/capstan")).unwrap();
        assert!(esp.path().join("EFI/BOOT").is_dir());
        assert!(esp.path().join("EFI/capstan").is_dir());
        assert!(esp.path().join("loader/entries").is_dir());
    }

    #[test]
    fn test_parse_conf_multiline_fixture() {
        let conf = parse_conf(indoc! {"
            title My OS
            uki /EFI/capstan/active.efi
            cmdline console=ttyS0 root=LABEL=CAP_STATE

            sort-key 0001
        "});
        assert_eq!(conf.len(), 4);
        assert_eq!(conf["cmdline"], "console=ttyS0 root=LABEL=CAP_STATE");
    }
}
