use std::{collections::BTreeMap, fmt, path::PathBuf, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use url::Url;

use sysdefs::{
    filesystems::{FilesystemKind, PartitionFlag},
    tpm2::Pcr,
};

use crate::{
    constants::{
        DEFAULT_ATTESTATION_TIMEOUT_SECS, DEFAULT_TPM_NV_INDEX, DEFAULT_VENDOR,
        PARTITION_SIZE_GROW,
    },
    error::{CapstanError, InvalidConfigError},
};

/// The merged configuration value, created once per command invocation and
/// threaded explicitly through all components. The agent does not discover or
/// merge configuration documents itself; it consumes one already-merged value.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    /// Emit a structured trace on failure in addition to the one-line summary.
    #[serde(default)]
    pub debug: bool,

    /// Fail the action when a hook stage fails, instead of logging and
    /// continuing.
    #[serde(default)]
    pub strict: bool,

    /// Which bootloader variant manages boot entries on this host.
    #[serde(default)]
    pub bootloader: BootloaderVariant,

    /// Name of the vendor directory under `EFI/` on the ESP.
    #[serde(default = "default_vendor")]
    pub vendor: String,

    #[serde(default)]
    pub encryption: EncryptionConfig,

    /// When present, registry payloads are signature-verified before
    /// extraction.
    #[serde(default)]
    pub verify: Option<VerifyConfig>,

    #[serde(default)]
    pub install: Option<InstallSpec>,

    #[serde(default)]
    pub upgrade: Option<UpgradeSpec>,

    #[serde(default)]
    pub reset: Option<ResetSpec>,

    /// Declarative stages keyed by hook point name.
    #[serde(default)]
    pub stages: BTreeMap<String, Vec<Stage>>,

    /// Optional executable that receives hook events as JSON on stdin.
    /// Failures of the notifier are never surfaced.
    #[serde(default)]
    pub event_notifier: Option<PathBuf>,
}

fn default_vendor() -> String {
    DEFAULT_VENDOR.into()
}

impl Config {
    /// Parses a merged configuration document.
    pub fn from_yaml(content: &str) -> Result<Self, CapstanError> {
        use crate::error::ReportError;
        serde_yaml::from_str::<Config>(content)
            .structured(InvalidConfigError::ParseConfig)
            .and_then(|config| {
                config.validate()?;
                Ok(config)
            })
    }

    /// Checks the internal consistency rules that cut across fields.
    pub fn validate(&self) -> Result<(), CapstanError> {
        if let Some(install) = &self.install {
            install.validate()?;
        }
        Ok(())
    }

    /// Whether the host boots through the unified signed-image variant.
    pub fn is_unified_boot(&self) -> bool {
        self.bootloader == BootloaderVariant::Unified
    }
}

/// The two supported bootloader variants.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BootloaderVariant {
    /// Legacy chained loader written to the ESP plus auxiliary partitions.
    #[default]
    Grub,
    /// Each slot is a single signed boot image in a shared ESP.
    Unified,
}

/// Where an OS payload comes from.
///
/// Serialized as a single string: `oci:<registry/name:tag>`, `dir:<path>`, or
/// `file:<path>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Container reference plus a platform selector.
    Registry { reference: String, platform: String },
    /// Absolute path to an already-extracted tree.
    Dir(PathBuf),
    /// Absolute path to a tar or OCI-layout archive.
    File(PathBuf),
}

/// Platform selector applied when no explicit one is given.
pub const DEFAULT_PLATFORM: &str = "linux/amd64";

impl ImageSource {
    pub fn is_registry(&self) -> bool {
        matches!(self, Self::Registry { .. })
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Self::Dir(_))
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Self::File(_))
    }
}

impl FromStr for ImageSource {
    type Err = CapstanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(reference) = s.strip_prefix("oci:") {
            // `@platform` may trail the reference to select a non-default arch
            let (reference, platform) = match reference.rsplit_once('@') {
                Some((r, p)) if p.contains('/') => (r, p),
                _ => (reference, DEFAULT_PLATFORM),
            };
            return Ok(Self::Registry {
                reference: reference.into(),
                platform: platform.into(),
            });
        }
        if let Some(path) = s.strip_prefix("dir:") {
            return Ok(Self::Dir(PathBuf::from(path)));
        }
        if let Some(path) = s.strip_prefix("file:") {
            return Ok(Self::File(PathBuf::from(path)));
        }
        Err(CapstanError::new(InvalidConfigError::UnknownImageSource {
            image_source: s.into(),
        }))
    }
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registry {
                reference,
                platform,
            } if platform == DEFAULT_PLATFORM => write!(f, "oci:{reference}"),
            Self::Registry {
                reference,
                platform,
            } => write!(f, "oci:{reference}@{platform}"),
            Self::Dir(path) => write!(f, "dir:{}", path.display()),
            Self::File(path) => write!(f, "file:{}", path.display()),
        }
    }
}

impl Serialize for ImageSource {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ImageSource {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(|e: CapstanError| {
            serde::de::Error::custom(format!("{:#}", e.unstructured("invalid image source")))
        })
    }
}

/// One partition of the declared layout.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PartitionSpec {
    /// Filesystem label; the primary lookup key for this partition.
    pub label: String,

    /// Requested size in MiB; `0` grows the partition to fill the disk.
    pub size_mib: u64,

    /// Filesystem written onto the partition.
    #[serde(default)]
    pub fs: FilesystemKind,

    /// Partition-table flags.
    #[serde(default)]
    pub flags: Vec<PartitionFlag>,
}

/// Specification of a clean install.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InstallSpec {
    /// Target disk device path.
    pub device: PathBuf,

    /// Partitions to create, in declared order.
    #[serde(default)]
    pub partitions: Vec<PartitionSpec>,

    /// Optional cloud-config payload copied into the OEM partition.
    #[serde(default)]
    pub cloud_config: Option<String>,

    /// OS payload for the active slot.
    #[serde(default)]
    pub active: Option<ImageSource>,

    /// OS payload for the passive slot; defaults to the active payload.
    #[serde(default)]
    pub passive: Option<ImageSource>,

    /// OS payload for the recovery slot; defaults to the active payload.
    #[serde(default)]
    pub recovery: Option<ImageSource>,

    /// Labels of partitions to encrypt after deployment.
    #[serde(default)]
    pub encrypt_partitions: Vec<String>,

    /// Skip wipe and partitioning; install into a pre-provisioned disk.
    #[serde(default)]
    pub no_format: bool,

    /// Boot entries whose cmdline contains any of these strings are dropped.
    #[serde(default)]
    pub skip_entries: Vec<String>,
}

impl InstallSpec {
    pub fn validate(&self) -> Result<(), CapstanError> {
        let mut seen = std::collections::BTreeSet::new();
        for partition in &self.partitions {
            if !seen.insert(partition.label.as_str()) {
                return Err(CapstanError::new(
                    InvalidConfigError::DuplicatePartitionLabel {
                        label: partition.label.clone(),
                    },
                ));
            }
            if partition.flags.contains(&PartitionFlag::Esp)
                && partition.fs != FilesystemKind::Vfat
            {
                return Err(CapstanError::new(InvalidConfigError::EspNotVfat {
                    label: partition.label.clone(),
                }));
            }
        }
        // A grow partition may only close the layout.
        if let Some(position) = self
            .partitions
            .iter()
            .position(|p| p.size_mib == PARTITION_SIZE_GROW)
        {
            if position + 1 != self.partitions.len() {
                return Err(CapstanError::new(
                    InvalidConfigError::GrowPartitionNotLast {
                        label: self.partitions[position].label.clone(),
                    },
                ));
            }
        }
        for label in &self.encrypt_partitions {
            if !self.partitions.iter().any(|p| &p.label == label) {
                return Err(CapstanError::new(
                    InvalidConfigError::UnknownEncryptedPartition {
                        label: label.clone(),
                    },
                ));
            }
        }
        Ok(())
    }

    /// Returns the payload source for the given slot, falling back to the
    /// active payload.
    pub fn source_for(&self, slot: &str) -> Option<&ImageSource> {
        match slot {
            "passive" => self.passive.as_ref().or(self.active.as_ref()),
            "recovery" => self.recovery.as_ref().or(self.active.as_ref()),
            _ => self.active.as_ref(),
        }
    }
}

/// Which slot an upgrade replaces.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum UpgradeSlot {
    #[default]
    Active,
    Recovery,
}

/// Specification of an upgrade.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpgradeSpec {
    /// Slot the new artefact replaces.
    #[serde(default)]
    pub slot: UpgradeSlot,

    /// Source of the new artefact.
    #[serde(default)]
    pub source: Option<ImageSource>,

    /// Preserve paths excluded from deployment instead of replacing them.
    #[serde(default)]
    pub preserve_excludes: bool,

    /// Explicit boot entry to mark default after rotation.
    #[serde(default)]
    pub boot_entry: Option<String>,
}

/// Specification of a state reset.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ResetSpec {
    /// Reformat the persistent partition.
    #[serde(default)]
    pub format_persistent: bool,

    /// Reformat the OEM partition.
    #[serde(default)]
    pub format_oem: bool,

    /// Recovery artefact to seed the active slot from; defaults to the
    /// recovery slot already on disk.
    #[serde(default)]
    pub source: Option<ImageSource>,

    /// Reboot when done.
    #[serde(default)]
    pub reboot: bool,
}

/// Partition-encryption configuration, scanned once before the OEM partition
/// is unmounted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EncryptionConfig {
    /// Remote challenger used by the attestation-based strategy.
    #[serde(default)]
    pub challenger: Option<ChallengerConfig>,

    /// TPM NV index holding the locally stored passphrase.
    #[serde(default = "default_nv_index")]
    pub nv_index: String,

    /// PCR indices a TPM2 policy keyslot is bound to.
    #[serde(default = "default_pcrs")]
    pub pcrs: Vec<Pcr>,

    /// Deadline for the remote attestation exchange, in seconds.
    #[serde(default = "default_attestation_timeout")]
    pub attestation_timeout_secs: u64,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            challenger: None,
            nv_index: default_nv_index(),
            pcrs: default_pcrs(),
            attestation_timeout_secs: default_attestation_timeout(),
        }
    }
}

fn default_nv_index() -> String {
    DEFAULT_TPM_NV_INDEX.into()
}

fn default_pcrs() -> Vec<Pcr> {
    vec![Pcr::Pcr7, Pcr::Pcr11]
}

fn default_attestation_timeout() -> u64 {
    DEFAULT_ATTESTATION_TIMEOUT_SECS
}

/// Remote key-server configuration.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChallengerConfig {
    /// Challenger endpoint.
    #[serde(default)]
    pub server: Option<Url>,

    /// Discover the challenger via local broadcast instead of a fixed URL.
    #[serde(default)]
    pub mdns: bool,

    /// PEM certificate pinning the challenger identity.
    #[serde(default)]
    pub certificate: Option<String>,
}

impl ChallengerConfig {
    /// Whether this configuration can resolve an endpoint at all.
    pub fn is_resolvable(&self) -> bool {
        self.server.is_some() || self.mdns
    }
}

/// Payload signature verification settings.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VerifyConfig {
    /// Pinned public key; keyless verification is used when absent.
    #[serde(default)]
    pub public_key: Option<PathBuf>,
}

/// One declarative stage executed at a hook point.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Stage {
    /// Stage name, used in logs and errors.
    pub name: String,

    /// Shell commands run in declared order.
    #[serde(default)]
    pub commands: Vec<String>,

    /// Files written before the commands run.
    #[serde(default)]
    pub files: Vec<StageFile>,
}

/// A file written by a stage.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StageFile {
    pub path: PathBuf,

    #[serde(default)]
    pub content: String,

    /// Octal mode string, e.g. `"0644"`.
    #[serde(default)]
    pub permissions: Option<String>,
}
