use std::fmt::{Debug, Write};
use std::{borrow::Cow, panic::Location};

use serde::{ser::SerializeStruct, Deserialize, Serialize};
use strum_macros::IntoStaticStr;

/// The merged configuration is internally inconsistent or could not be read.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum InvalidConfigError {
    #[error("Failed to load configuration from '{path}'")]
    LoadConfig { path: String },
    #[error("Failed to parse configuration")]
    ParseConfig,
    #[error("No '{action}' specification present in the configuration")]
    MissingSpec { action: &'static str },
    #[error("Partition '{label}' requests to fill the disk but is not last in the layout")]
    GrowPartitionNotLast { label: String },
    #[error("Partition label '{label}' is declared more than once")]
    DuplicatePartitionLabel { label: String },
    #[error("ESP partition '{label}' must be formatted as vfat")]
    EspNotVfat { label: String },
    #[error("ESP partition '{label}' is smaller than the required {min_mib} MiB")]
    EspTooSmall { label: String, min_mib: u64 },
    #[error("Partition '{label}' requested for encryption is not in the layout")]
    UnknownEncryptedPartition { label: String },
    #[error("Image source '{image_source}' is not recognised")]
    UnknownImageSource { image_source: String },
}

/// A disk, partition, or filesystem operation failed.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum StorageError {
    #[error("Device with label '{label}' did not appear after {retries} attempts")]
    DeviceNotFound { label: String, retries: u64 },
    #[error("Failed to inventory block devices")]
    Inventory,
    #[error("Failed to deactivate pre-existing device-mapper targets on '{disk}'")]
    DeactivateMappers { disk: String },
    #[error("Failed to wipe partition table on '{disk}'")]
    WipeDisk { disk: String },
    #[error("Failed to partition '{disk}'")]
    PartitionDisk { disk: String },
    #[error("Failed to format '{node}'")]
    Format { node: String },
    #[error("Failed to mount '{target}'")]
    Mount { target: String },
    #[error("'{target}' is already mounted")]
    AlreadyMounted { target: String },
    #[error("Failed to unmount '{target}'")]
    Unmount { target: String },
    #[error("Failed to remount '{target}'")]
    Remount { target: String },
    #[error("Failed to attach a loop device to '{file}'")]
    LoopAttach { file: String },
    #[error("Failed to detach loop device '{device}'")]
    LoopDetach { device: String },
    #[error("Image '{file}' is mounted without a recorded loop device")]
    LoopDeviceMissing { file: String },
}

/// Encrypting or unlocking a partition failed, or its prerequisites are not
/// met on this host.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionError {
    #[error("Encryption requires access to a TPM 2.0 device but none is accessible")]
    TpmMissing,
    #[error("Boot toolchain version {version} is older than the required {required}")]
    BootToolTooOld { version: u64, required: u64 },
    #[error("No remote challenger endpoint could be resolved from the configuration")]
    EndpointUnresolvable,
    #[error("Remote attestation exchange did not complete within {seconds} seconds")]
    AttestationTimeout { seconds: u64 },
    #[error("Remote attestation exchange failed")]
    AttestationExchange,
    #[error("Failed to create LUKS container on '{label}'")]
    LuksFormat { label: String },
    #[error("Failed to enroll keyslot for '{label}'")]
    Enroll { label: String },
    #[error("Failed to store passphrase in TPM NV index {index}")]
    NvStore { index: String },
    #[error("Failed to read passphrase from TPM NV index {index}")]
    NvRead { index: String },
    #[error("Failed to unlock '{label}'")]
    Unlock { label: String },
    #[error("Mapper device '{mapper}' did not appear after unlocking")]
    MapperMissing { mapper: String },
    #[error("Failed to close encrypted device '{mapper}'")]
    Close { mapper: String },
}

/// A boot-entry or bootloader operation failed.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum BootError {
    #[error("Multiple entry files resolve to role '{role}'")]
    AmbiguousEntry { role: String },
    #[error("No entry file resolves to role '{role}'")]
    EntryNotFound { role: String },
    #[error("Rotation from '{old_role}' to '{new_role}' left both artefact sets in place")]
    PartialRotation { old_role: String, new_role: String },
    #[error("Failed to rotate boot artefacts from '{old_role}' to '{new_role}'")]
    Rotate { old_role: String, new_role: String },
    #[error("Failed to install boot entries")]
    InstallEntries,
    #[error("Failed to select default boot entry '{name}'")]
    SelectDefault { name: String },
    #[error("Failed to assign sort keys to boot entries")]
    AssignSortKeys,
    #[error("Failed to add boot-assessment counters")]
    BootAssessment,
    #[error("No bootloader stage directory found under '{root}'")]
    StageNotFound { root: String },
    #[error("Failed to install the chained bootloader")]
    InstallChainloader,
    #[error("Failed to update grub environment block at '{path}'")]
    GrubEnv { path: String },
}

/// A step of an install, upgrade, or reset action failed.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ServicingError {
    #[error("Chroot is already active")]
    ChrootAlreadyActive,
    #[error("Failed to enter chroot")]
    ChrootEnter,
    #[error("Failed to exit chroot")]
    ChrootExit,
    #[error("Hook '{hook}' failed")]
    HookFailed { hook: String },
    #[error("Stage '{stage}' failed")]
    StageFailed { stage: String },
    #[error("Failed to deploy OS payload into slot '{slot}'")]
    Deploy { slot: String },
    #[error("Failed to copy the cloud-config payload")]
    CopyCloudConfig,
    #[error("Installation aborted by fail sentinel")]
    FailSentinel,
    #[error("Required tools are missing from the execution environment")]
    MissingTools,
    #[error("Operation rejected by the user")]
    UserCancelled,
    #[error("Failed to reboot")]
    Reboot,
    #[error("Cleanup failed")]
    Cleanup,
}

/// An uncategorized error occurred or a bug was encountered.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum InternalError {
    #[error("Internal error: {0}")]
    Internal(&'static str),
}

/// Each variant of `ErrorKind` corresponds to a different category of error.
/// The categories are intended to be user-meaningful: they separate bad input
/// from host-state problems from agent bugs.
#[derive(Debug, Eq, thiserror::Error, IntoStaticStr, PartialEq)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
    #[error(transparent)]
    InvalidConfig(#[from] InvalidConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    #[error(transparent)]
    Boot(#[from] BootError),

    #[error(transparent)]
    Servicing(#[from] ServicingError),

    #[error(transparent)]
    Internal(#[from] InternalError),
}

#[derive(Debug)]
struct CapstanErrorInner {
    kind: ErrorKind,
    location: &'static Location<'static>,
    source: Option<anyhow::Error>,
    context: Vec<(Cow<'static, str>, &'static Location<'static>)>,
}

/// Structured error carried out of every engine operation. Wraps an
/// [`ErrorKind`] with the raising location, an optional unstructured source,
/// and a stack of context messages added on the way up.
pub struct CapstanError(Box<CapstanErrorInner>);

impl CapstanError {
    #[track_caller]
    pub fn new(kind: impl Into<ErrorKind>) -> Self {
        CapstanError(Box::new(CapstanErrorInner {
            kind: kind.into(),
            location: Location::caller(),
            source: None,
            context: Vec::new(),
        }))
    }

    #[track_caller]
    pub fn with_source(kind: impl Into<ErrorKind>, source: anyhow::Error) -> Self {
        CapstanError(Box::new(CapstanErrorInner {
            kind: kind.into(),
            location: Location::caller(),
            source: Some(source),
            context: Vec::new(),
        }))
    }

    /// Returns a reference to the inner ErrorKind.
    pub fn kind(&self) -> &ErrorKind {
        &self.0.kind
    }

    /// Flatten into an unstructured error, preserving the cause chain.
    pub fn unstructured(self, context: impl Into<Cow<'static, str>>) -> anyhow::Error {
        match self.0.source {
            Some(source) => source.context(self.0.kind).context(context.into()),
            None => anyhow::Error::from(self.0.kind).context(context.into()),
        }
    }
}

pub trait ReportError<T, K> {
    /// Convert this error into a structured CapstanError.
    fn structured(self, kind: K) -> Result<T, CapstanError>;
}

impl<T, K> ReportError<T, K> for Option<T>
where
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, CapstanError> {
        match self {
            Some(t) => Ok(t),
            None => Err(CapstanError::new(kind)),
        }
    }
}

impl<T, E, K> ReportError<T, K> for Result<T, E>
where
    E: Into<anyhow::Error>,
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, CapstanError> {
        match self {
            Ok(o) => Ok(o),
            Err(e) => Err(CapstanError::with_source(kind, e.into())),
        }
    }
}

pub trait CapstanResultExt<T> {
    /// Attach a context message to the error.
    fn message(self, context: impl Into<Cow<'static, str>>) -> Result<T, CapstanError>;
}

impl<T> CapstanResultExt<T> for Result<T, CapstanError> {
    #[track_caller]
    fn message(mut self, context: impl Into<Cow<'static, str>>) -> Result<T, CapstanError> {
        if let Err(ref mut e) = self {
            e.0.context.push((context.into(), Location::caller()));
        }
        self
    }
}

impl Serialize for CapstanError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("capstan-error", 5)?;
        state.serialize_field("message", &self.0.kind.to_string())?;
        match self.0.kind {
            ErrorKind::InvalidConfig(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Storage(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Encryption(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Boot(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Servicing(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Internal(ref e) => state.serialize_field("error", e)?,
        }
        state.serialize_field("category", <&str>::from(&self.0.kind))?;
        state.serialize_field(
            "location",
            &format!("{}:{}", self.0.location.file(), self.0.location.line()),
        )?;
        match self.0.source {
            Some(ref e) => state.serialize_field("cause", &Some(format!("{:?}", e)))?,
            None => state.serialize_field("cause", &None::<String>)?,
        }
        state.end()
    }
}

impl Debug for CapstanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} at {}:{}",
            self.0.kind,
            self.0.location.file(),
            self.0.location.line()
        )?;

        if !self.0.context.is_empty() {
            writeln!(f, "\n\nContext:")?;
            for (i, (context, location)) in self.0.context.iter().enumerate() {
                for (j, line) in context.split('\n').enumerate() {
                    if j == 0 {
                        write!(f, "{: >5}: ", i)?;
                    } else {
                        f.write_str("\n       ")?;
                    }
                    f.write_str(line)?;
                }
                writeln!(f, " at {}:{}", location.file(), location.line())?;
            }
        }

        if let Some(ref source) = self.0.source {
            writeln!(f, "\n\nCaused by:")?;
            let mut index = 0;
            let mut source: Option<&dyn std::error::Error> = Some(source.as_ref());
            while let Some(e) = source {
                for (i, line) in e.to_string().split('\n').enumerate() {
                    if i == 0 {
                        write!(f, "{: >5}: ", index)?;
                    } else {
                        f.write_str("\n       ")?;
                    }
                    f.write_str(line)?;
                }
                f.write_char('\n')?;
                source = e.source();
                index += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;
    use serde_yaml::Value;

    use super::*;

    #[test]
    fn test_error_serialize() {
        let e = Result::<(), _>::Err(anyhow::anyhow!("underlying failure"))
            .context("failed to probe device")
            .structured(StorageError::DeviceNotFound {
                label: "CAP_OEM".into(),
                retries: 10,
            })
            .unwrap_err();
        match serde_yaml::to_value(e).unwrap() {
            Value::Mapping(m) => {
                assert_eq!(m.len(), 5);
                assert_eq!(m["category"], Value::String("storage".into()));
                assert_eq!(
                    m["message"],
                    Value::String(
                        "Device with label 'CAP_OEM' did not appear after 10 attempts".into()
                    )
                );
                assert!(matches!(m["cause"], Value::String(_)));
                match m["location"] {
                    Value::String(ref s) => assert!(s.contains("error.rs:")),
                    _ => panic!("location isn't string"),
                }
            }
            _ => panic!("value isn't mapping"),
        }
    }

    #[test]
    fn test_error_debug() {
        let error = Err::<(), _>(anyhow::anyhow!("z"))
            .context("x\ny")
            .structured(InternalError::Internal("w"))
            .unwrap_err();
        assert_eq!(
            format!("{:?}", error),
            format!(
                "Internal error: w at {}:{}\n\nCaused by:\n    0: x\n       y\n    1: z\n",
                error.0.location.file(),
                error.0.location.line(),
            ),
        );
    }

    #[test]
    fn test_message_context() {
        let error = Err::<(), _>(CapstanError::new(ServicingError::ChrootAlreadyActive))
            .message("while preparing the target")
            .unwrap_err();
        let rendered = format!("{error:?}");
        assert!(rendered.contains("Chroot is already active"));
        assert!(rendered.contains("while preparing the target"));
    }

    #[test]
    fn test_option_structured() {
        let found: Option<u32> = None;
        let error = found
            .structured(BootError::EntryNotFound {
                role: "active".into(),
            })
            .unwrap_err();
        assert_eq!(
            error.kind(),
            &ErrorKind::Boot(BootError::EntryNotFound {
                role: "active".into()
            })
        );
    }
}
