pub mod entries;
pub mod grub;

use std::{fmt, path::PathBuf, str::FromStr};

use strum_macros::{Display, EnumString};

use capstan_api::constants::SORT_KEY_OTHER;

/// The symbolic position a boot entry occupies. `Unassigned` is the transient
/// staging role new artefacts arrive under; no entry retains it after a
/// successful install or upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    Unassigned,
    Active,
    Passive,
    Recovery,
    Statereset,
    Other,
}

/// The four roles materialised out of the `unassigned` staging set.
pub const STANDARD_ROLES: [Role; 4] = [Role::Active, Role::Passive, Role::Recovery, Role::Statereset];

impl Role {
    /// Sort-key ordering entries in the boot menu.
    pub fn sort_key(&self) -> &'static str {
        match self {
            Role::Active => "0001",
            Role::Passive => "0002",
            Role::Recovery => "0003",
            Role::Statereset => "0004",
            Role::Unassigned | Role::Other => SORT_KEY_OTHER,
        }
    }

    /// Resolves a logical entry name to a role. `cos` aliases `active`,
    /// `fallback` aliases `passive`.
    pub fn resolve_logical(name: &str) -> Option<Role> {
        match name {
            "cos" | "active" => Some(Role::Active),
            "fallback" | "passive" => Some(Role::Passive),
            "recovery" => Some(Role::Recovery),
            "statereset" => Some(Role::Statereset),
            _ => None,
        }
    }
}

/// Boot-assessment counters embedded in an entry file's base name, directly
/// before the extension: `+N` tries left, `+N-M` tries left and failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assessment {
    pub tries_left: u64,
    pub failures: Option<u64>,
}

impl Assessment {
    /// The counter a fresh entry starts with.
    pub const INITIAL: Assessment = Assessment {
        tries_left: 3,
        failures: None,
    };
}

impl fmt::Display for Assessment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.failures {
            Some(failures) => write!(f, "+{}-{}", self.tries_left, failures),
            None => write!(f, "+{}", self.tries_left),
        }
    }
}

impl FromStr for Assessment {
    type Err = ();

    /// Parses `+N` or `+N-M`; anything else is not an assessment suffix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let counters = s.strip_prefix('+').ok_or(())?;
        let (tries, failures) = match counters.split_once('-') {
            Some((tries, failures)) => (tries, Some(failures)),
            None => (counters, None),
        };
        if tries.is_empty() || !tries.bytes().all(|b| b.is_ascii_digit()) {
            return Err(());
        }
        let failures = match failures {
            None => None,
            Some(f) if !f.is_empty() && f.bytes().all(|b| b.is_ascii_digit()) => {
                Some(f.parse().map_err(|_| ())?)
            }
            Some(_) => return Err(()),
        };
        Ok(Assessment {
            tries_left: tries.parse().map_err(|_| ())?,
            failures,
        })
    }
}

/// Splits an entry file stem into its role part and assessment suffix.
///
/// The role part runs up to the first `+`; the assessment anchors on the last
/// `+` group, and only a well-formed `+N` / `+N-M` there counts. A stem like
/// `test3+asdasd` resolves to role `test3` with no assessment, while
/// `test1++++++5` resolves to role `test1` with assessment `+5`.
pub fn split_entry_stem(stem: &str) -> (&str, Option<Assessment>) {
    let base = match stem.find('+') {
        Some(position) => &stem[..position],
        None => stem,
    };
    let assessment = stem
        .rfind('+')
        .and_then(|position| stem[position..].parse().ok());
    (base, assessment)
}

/// One selectable boot option, as read back from a loader entries directory.
#[derive(Debug, Clone, PartialEq)]
pub struct BootEntry {
    /// Role resolved from the file's base name; names that are no standard
    /// role map to `Other`.
    pub role: Role,

    /// Base name of the entry file, without assessment suffix or extension.
    pub base: String,

    /// Human-readable label.
    pub title: Option<String>,

    /// Boot image reference (`uki` preferred over the legacy `efi` key).
    pub image: Option<String>,

    /// Kernel command line.
    pub cmdline: Option<String>,

    /// 4-digit menu ordering key.
    pub sort_key: Option<String>,

    /// Boot-assessment counters from the file name.
    pub assessment: Option<Assessment>,

    /// Whether the top-level loader configuration points here.
    pub default: bool,

    /// The entry file itself.
    pub path: PathBuf,
}
