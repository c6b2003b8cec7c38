use std::{
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context, Error};
use log::{debug, info};
use rand::RngCore;
use serde::Deserialize;
use uuid::Uuid;

use capstan_api::{
    config::{ChallengerConfig, Config, EncryptionConfig},
    constants::{MAPPER_DIR, MIN_BOOT_TOOL_VERSION},
    error::{CapstanError, EncryptionError, ReportError},
};
use osutils::{bootctl, cryptsetup, lsblk, tpm2};
use sysdefs::{filesystems::FilesystemKind, tpm2::Pcr};

use super::{partitioning, Partition};

/// Attempts to resolve a partition by label before giving up.
const RESOLVE_RETRIES: u64 = 10;

/// Attempts to wait for a mapper node before the unlock is reissued.
const MAPPER_WAIT_ATTEMPTS: u32 = 10;

/// Length of generated passphrases, in bytes of entropy.
const PASSPHRASE_BYTES: usize = 32;

/// Derives the LUKS container UUID from the partition label. Identical across
/// re-creations of the same label.
pub fn luks_uuid(label: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, label.as_bytes())
}

/// The partition-encryption engine. A closed set of three keying strategies,
/// selected once per invocation by examining the merged configuration.
pub enum EncryptionStrategy {
    /// Passphrase obtained via a TPM-backed attestation exchange against a
    /// remote endpoint.
    RemoteKms(RemoteKms),
    /// Ephemeral passphrase replaced by a TPM2 policy keyslot bound to
    /// declared PCRs.
    TpmWithPcr(TpmWithPcr),
    /// Random passphrase stored in TPM non-volatile memory.
    LocalTpmNv(LocalTpmNv),
}

impl EncryptionStrategy {
    /// First match wins: a reachable challenger selects the remote strategy,
    /// unified boot selects the PCR policy, everything else stores the key in
    /// TPM NV.
    pub fn select(config: &Config) -> Self {
        if config
            .encryption
            .challenger
            .as_ref()
            .is_some_and(ChallengerConfig::is_resolvable)
        {
            return Self::RemoteKms(RemoteKms::new(&config.encryption));
        }
        if config.is_unified_boot() {
            return Self::TpmWithPcr(TpmWithPcr::new(&config.encryption));
        }
        Self::LocalTpmNv(LocalTpmNv::new(&config.encryption))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::RemoteKms(_) => "remote-kms",
            Self::TpmWithPcr(_) => "tpm-pcr-policy",
            Self::LocalTpmNv(_) => "local-tpm-nv",
        }
    }

    /// Checks that this host can carry the strategy at all, before any disk
    /// state is touched.
    pub fn validate(&self) -> Result<(), CapstanError> {
        match self {
            Self::RemoteKms(strategy) => strategy.validate(),
            Self::TpmWithPcr(strategy) => strategy.validate(),
            Self::LocalTpmNv(strategy) => strategy.validate(),
        }
    }

    /// Encrypts one partition: resolve by label, unmount children, create the
    /// LUKS2 container, format the mapper, enroll, close.
    pub fn encrypt(&mut self, partition: &Partition) -> Result<(), CapstanError> {
        info!(
            "Encrypting '{}' using the {} strategy",
            partition.label,
            self.name()
        );

        let device = partitioning::get_device_by_label(&partition.label, RESOLVE_RETRIES)?;
        partitioning::unmount_with_children(partition)?;

        let filesystem = partition.fs_after_unlock();

        match self {
            Self::RemoteKms(strategy) => {
                let passphrase = strategy.obtain_passphrase(&partition.label)?;
                create_container(&device, partition, filesystem, passphrase.as_bytes())?;
                // The exchange reproduces the same passphrase on future
                // boots; the password keyslot is the enrollment.
                strategy.partitions.push(partition.label.clone());
            }
            Self::TpmWithPcr(strategy) => {
                let passphrase = generate_passphrase();
                let mapper = create_container(&device, partition, filesystem, passphrase.as_bytes())?;
                strategy
                    .enroll(&device, passphrase.as_bytes())
                    .map_err(|e| {
                        close_quietly(&mapper);
                        e
                    })?;
                strategy.partitions.push(partition.label.clone());
            }
            Self::LocalTpmNv(strategy) => {
                let passphrase = strategy.load_or_create_passphrase()?;
                create_container(&device, partition, filesystem, passphrase.as_bytes())?;
                strategy.partitions.push(partition.label.clone());
            }
        }

        cryptsetup::luks_close(&partition.mapper_name()).structured(EncryptionError::Close {
            mapper: partition.mapper_name(),
        })?;

        Ok(())
    }

    /// Unlocks every partition the strategy knows about, either through a
    /// prior encrypt or by rediscovering LUKS partitions on the system.
    pub fn unlock(&self) -> Result<(), CapstanError> {
        let labels = match self {
            Self::RemoteKms(strategy) => &strategy.partitions,
            Self::TpmWithPcr(strategy) => &strategy.partitions,
            Self::LocalTpmNv(strategy) => &strategy.partitions,
        };
        let labels = if labels.is_empty() {
            rediscover_luks_labels()?
        } else {
            labels.clone()
        };

        for label in &labels {
            self.unlock_one(label)?;
        }
        Ok(())
    }

    fn unlock_one(&self, label: &str) -> Result<(), CapstanError> {
        let device = partitioning::get_device_by_label(label, RESOLVE_RETRIES)?;
        let mapper = label.to_lowercase();
        info!("Unlocking '{label}' as '{mapper}'");

        self.open(&device, &mapper, label)?;

        // The mapper node can trail the ioctl; wait, then reissue the unlock
        // once before failing.
        if wait_for_mapper(Path::new(MAPPER_DIR), &mapper, MAPPER_WAIT_ATTEMPTS).is_err() {
            debug!("Mapper '{mapper}' did not appear, reissuing unlock");
            self.open(&device, &mapper, label)?;
            wait_for_mapper(Path::new(MAPPER_DIR), &mapper, MAPPER_WAIT_ATTEMPTS)
                .structured(EncryptionError::MapperMissing { mapper })?;
        }
        Ok(())
    }

    fn open(&self, device: &Path, mapper: &str, label: &str) -> Result<(), CapstanError> {
        match self {
            Self::RemoteKms(strategy) => {
                let passphrase = strategy.obtain_passphrase(label)?;
                cryptsetup::luks_open(device, mapper, passphrase.as_bytes())
            }
            Self::TpmWithPcr(_) => cryptsetup::luks_open_token(device, mapper),
            Self::LocalTpmNv(strategy) => {
                let passphrase = strategy.read_passphrase()?;
                cryptsetup::luks_open(device, mapper, passphrase.as_bytes())
            }
        }
        .structured(EncryptionError::Unlock {
            label: label.into(),
        })
    }
}

/// Creates the LUKS2 container, opens it, and formats the mapper. Returns the
/// mapper name; the container stays open for strategy enrollment.
fn create_container(
    device: &Path,
    partition: &Partition,
    filesystem: FilesystemKind,
    passphrase: &[u8],
) -> Result<String, CapstanError> {
    debug!(
        "Creating LUKS2 container on '{}' (passphrase length {})",
        device.display(),
        passphrase.len()
    );

    cryptsetup::luks_format(device, &partition.label, luks_uuid(&partition.label), passphrase)
        .structured(EncryptionError::LuksFormat {
            label: partition.label.clone(),
        })?;

    let mapper = partition.mapper_name();
    cryptsetup::luks_open(device, &mapper, passphrase).structured(EncryptionError::Unlock {
        label: partition.label.clone(),
    })?;
    wait_for_mapper(Path::new(MAPPER_DIR), &mapper, MAPPER_WAIT_ATTEMPTS).structured(
        EncryptionError::MapperMissing {
            mapper: mapper.clone(),
        },
    )?;

    let mapper_path = Path::new(MAPPER_DIR).join(&mapper);
    partitioning::format_partition(&mapper_path, filesystem, &partition.label).map_err(|e| {
        close_quietly(&mapper);
        e
    })?;

    Ok(mapper)
}

fn close_quietly(mapper: &str) {
    if let Err(e) = cryptsetup::luks_close(mapper) {
        log::warn!("Failed to close mapper '{mapper}' during unwinding: {e:#}");
    }
}

/// Waits for a mapper node to appear, backing off between attempts.
fn wait_for_mapper(mapper_dir: &Path, mapper: &str, attempts: u32) -> Result<(), Error> {
    let node = mapper_dir.join(mapper);
    for attempt in 1..=attempts {
        if node.exists() {
            return Ok(());
        }
        thread::sleep(Duration::from_millis(u64::from(attempt) * 200).min(Duration::from_secs(1)));
    }
    Err(anyhow!(
        "Mapper node '{}' did not appear after {attempts} attempts",
        node.display()
    ))
}

/// Finds the labels of LUKS partitions present on the system.
fn rediscover_luks_labels() -> Result<Vec<String>, CapstanError> {
    let devices = lsblk::find(|device| device.fstype.as_deref() == Some("crypto_LUKS"))
        .structured(capstan_api::error::StorageError::Inventory)?;
    Ok(devices
        .into_iter()
        .filter_map(|device| device.label)
        .collect())
}

fn generate_passphrase() -> String {
    let mut bytes = [0u8; PASSPHRASE_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Remote key-server strategy.
pub struct RemoteKms {
    challenger: ChallengerConfig,
    timeout: Duration,
    partitions: Vec<String>,
}

#[derive(Deserialize)]
struct ChallengeResponse {
    nonce: String,
    #[serde(default = "default_pcr_selection")]
    pcr_selection: String,
}

#[derive(Deserialize)]
struct PassphraseResponse {
    passphrase: String,
}

fn default_pcr_selection() -> String {
    "sha256:0,7".into()
}

impl RemoteKms {
    fn new(config: &EncryptionConfig) -> Self {
        Self {
            challenger: config.challenger.clone().unwrap_or_default(),
            timeout: Duration::from_secs(config.attestation_timeout_secs),
            partitions: Vec::new(),
        }
    }

    fn validate(&self) -> Result<(), CapstanError> {
        if !self.challenger.is_resolvable() {
            return Err(CapstanError::new(EncryptionError::EndpointUnresolvable));
        }
        if !tpm2::is_present() {
            return Err(CapstanError::new(EncryptionError::TpmMissing));
        }
        Ok(())
    }

    /// Obtains the passphrase for a partition through the attestation
    /// exchange: fetch a nonce, quote it, trade the quote for the passphrase.
    /// The exchange is deterministic on the server side, so every boot
    /// reproduces the same passphrase.
    fn obtain_passphrase(&self, label: &str) -> Result<String, CapstanError> {
        let endpoint = self
            .challenger
            .server
            .clone()
            .structured(EncryptionError::EndpointUnresolvable)?;

        let exchange = || -> Result<String, Error> {
            let client = reqwest::blocking::Client::builder()
                .timeout(self.timeout)
                .build()
                .context("Failed to build attestation client")?;

            let challenge: ChallengeResponse = client
                .post(endpoint.join("challenge").context("Malformed endpoint")?)
                .json(&serde_json::json!({ "label": label }))
                .send()
                .context("Challenge request failed")?
                .error_for_status()
                .context("Challenge request rejected")?
                .json()
                .context("Malformed challenge response")?;

            let quote = tpm2::quote(&challenge.nonce, &challenge.pcr_selection)
                .context("Failed to quote the challenge nonce")?;

            let response: PassphraseResponse = client
                .post(endpoint.join("passphrase").context("Malformed endpoint")?)
                .json(&serde_json::json!({
                    "label": label,
                    "message": quote.message,
                    "signature": quote.signature,
                }))
                .send()
                .context("Passphrase request failed")?
                .error_for_status()
                .context("Passphrase request rejected")?
                .json()
                .context("Malformed passphrase response")?;

            debug!(
                "Obtained passphrase for '{label}' (length {})",
                response.passphrase.len()
            );
            Ok(response.passphrase)
        };

        exchange().map_err(|e| {
            // A deadline overrun must fail the action, never downgrade to a
            // local strategy.
            if is_timeout(&e) {
                CapstanError::with_source(
                    EncryptionError::AttestationTimeout {
                        seconds: self.timeout.as_secs(),
                    },
                    e,
                )
            } else {
                CapstanError::with_source(EncryptionError::AttestationExchange, e)
            }
        })
    }
}

fn is_timeout(error: &Error) -> bool {
    error
        .chain()
        .any(|cause| match cause.downcast_ref::<reqwest::Error>() {
            Some(e) => e.is_timeout(),
            None => false,
        })
}

/// TPM2 policy strategy bound to declared PCR indices.
pub struct TpmWithPcr {
    pcrs: Vec<Pcr>,
    partitions: Vec<String>,
}

impl TpmWithPcr {
    fn new(config: &EncryptionConfig) -> Self {
        Self {
            pcrs: config.pcrs.clone(),
            partitions: Vec::new(),
        }
    }

    fn validate(&self) -> Result<(), CapstanError> {
        if !tpm2::is_present() {
            return Err(CapstanError::new(EncryptionError::TpmMissing));
        }
        let version = bootctl::version().structured(EncryptionError::BootToolTooOld {
            version: 0,
            required: MIN_BOOT_TOOL_VERSION,
        })?;
        if version < MIN_BOOT_TOOL_VERSION {
            return Err(CapstanError::new(EncryptionError::BootToolTooOld {
                version,
                required: MIN_BOOT_TOOL_VERSION,
            }));
        }
        Ok(())
    }

    fn pcr_list(&self) -> String {
        self.pcrs
            .iter()
            .map(|pcr| pcr.to_num().to_string())
            .collect::<Vec<_>>()
            .join("+")
    }

    /// Enrolls the TPM2 policy keyslot, then wipes the password keyslot so
    /// only the TPM can unlock.
    fn enroll(&self, device: &Path, passphrase: &[u8]) -> Result<(), CapstanError> {
        cryptsetup::enroll_tpm2_pcrs(device, &self.pcr_list(), passphrase).structured(
            EncryptionError::Enroll {
                label: device.display().to_string(),
            },
        )?;
        cryptsetup::wipe_password_slot(device).structured(EncryptionError::Enroll {
            label: device.display().to_string(),
        })
    }
}

/// Local strategy keeping the passphrase in TPM non-volatile storage.
pub struct LocalTpmNv {
    nv_index: String,
    partitions: Vec<String>,
}

impl LocalTpmNv {
    fn new(config: &EncryptionConfig) -> Self {
        Self {
            nv_index: config.nv_index.clone(),
            partitions: Vec::new(),
        }
    }

    fn validate(&self) -> Result<(), CapstanError> {
        if !tpm2::is_present() {
            return Err(CapstanError::new(EncryptionError::TpmMissing));
        }
        Ok(())
    }

    /// Returns the stored passphrase, generating and storing a fresh one on
    /// first use.
    fn load_or_create_passphrase(&self) -> Result<String, CapstanError> {
        if let Ok(stored) = tpm2::nv_read(&self.nv_index) {
            debug!(
                "Reusing stored passphrase from NV index {} (length {})",
                self.nv_index,
                stored.len()
            );
            return String::from_utf8(stored).structured(EncryptionError::NvRead {
                index: self.nv_index.clone(),
            });
        }

        let passphrase = generate_passphrase();
        tpm2::nv_store(&self.nv_index, passphrase.as_bytes()).structured(
            EncryptionError::NvStore {
                index: self.nv_index.clone(),
            },
        )?;
        Ok(passphrase)
    }

    fn read_passphrase(&self) -> Result<String, CapstanError> {
        let stored = tpm2::nv_read(&self.nv_index).structured(EncryptionError::NvRead {
            index: self.nv_index.clone(),
        })?;
        String::from_utf8(stored).structured(EncryptionError::NvRead {
            index: self.nv_index.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use capstan_api::config::BootloaderVariant;
    use tempfile::TempDir;

    fn config_with(
        challenger: Option<ChallengerConfig>,
        bootloader: BootloaderVariant,
    ) -> Config {
        Config {
            bootloader,
            encryption: EncryptionConfig {
                challenger,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_luks_uuid_is_deterministic() {
        let uuid = luks_uuid("MYDATA");
        assert_eq!(uuid, luks_uuid("MYDATA"));
        assert_ne!(uuid, luks_uuid("MYOTHERDATA"));
        assert_eq!(
            uuid,
            Uuid::new_v5(&Uuid::NAMESPACE_URL, "MYDATA".as_bytes())
        );
    }

    #[test]
    fn test_strategy_selection_first_match_wins() {
        // A resolvable challenger beats everything
        let config = config_with(
            Some(ChallengerConfig {
                server: Some("https://kms.example.com/".parse().unwrap()),
                ..Default::default()
            }),
            BootloaderVariant::Unified,
        );
        assert_eq!(EncryptionStrategy::select(&config).name(), "remote-kms");

        // Unified boot without a challenger selects the PCR policy
        let config = config_with(None, BootloaderVariant::Unified);
        assert_eq!(EncryptionStrategy::select(&config).name(), "tpm-pcr-policy");

        // A challenger that cannot resolve anything does not count
        let config = config_with(
            Some(ChallengerConfig::default()),
            BootloaderVariant::Grub,
        );
        assert_eq!(EncryptionStrategy::select(&config).name(), "local-tpm-nv");
    }

    #[test]
    fn test_remote_kms_validate_requires_endpoint() {
        let strategy = RemoteKms::new(&EncryptionConfig::default());
        let error = strategy.validate().unwrap_err();
        assert!(matches!(
            error.kind(),
            capstan_api::error::ErrorKind::Encryption(EncryptionError::EndpointUnresolvable)
        ));
    }

    #[test]
    fn test_obtain_passphrase_requires_server() {
        let strategy = RemoteKms {
            challenger: ChallengerConfig {
                mdns: true,
                ..Default::default()
            },
            timeout: Duration::from_secs(1),
            partitions: vec![],
        };
        // mdns alone cannot produce an endpoint to talk to
        strategy.obtain_passphrase("MYDATA").unwrap_err();
    }

    #[test]
    fn test_pcr_list_rendering() {
        let strategy = TpmWithPcr {
            pcrs: vec![Pcr::Pcr7, Pcr::Pcr11],
            partitions: vec![],
        };
        assert_eq!(strategy.pcr_list(), "7+11");
    }

    #[test]
    fn test_generate_passphrase_length_and_uniqueness() {
        let a = generate_passphrase();
        let b = generate_passphrase();
        assert_eq!(a.len(), PASSPHRASE_BYTES * 2);
        assert_ne!(a, b);
    }

    #[test]
    fn test_wait_for_mapper() {
        let mapper_dir = TempDir::new().unwrap();

        // Node present: immediate success
        std::fs::write(mapper_dir.path().join("mydata"), "").unwrap();
        wait_for_mapper(mapper_dir.path(), "mydata", 1).unwrap();

        // Node absent: bounded failure
        wait_for_mapper(mapper_dir.path(), "missing", 1).unwrap_err();
    }
}
