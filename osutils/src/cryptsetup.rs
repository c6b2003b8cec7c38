use std::path::Path;

use anyhow::{Context, Error};
use uuid::Uuid;

use crate::dependencies::Dependency;

/// Cipher specification string for the LUKS2 data segment.
pub const CIPHER: &str = "aes-xts-plain64";

/// Key size in bits, limited by the cipher specification.
pub const KEY_SIZE: &str = "512";

/// Runs `cryptsetup luksFormat` to initialize a LUKS2 container on the device,
/// stamping the given label and UUID. The passphrase is fed through stdin so
/// it never appears on a command line.
pub fn luks_format(
    device_path: impl AsRef<Path>,
    label: &str,
    uuid: Uuid,
    passphrase: &[u8],
) -> Result<(), Error> {
    Dependency::Cryptsetup
        .cmd()
        .arg("luksFormat")
        .arg("--batch-mode")
        .arg("--type")
        .arg("luks2")
        .arg("--cipher")
        .arg(CIPHER)
        .arg("--key-size")
        .arg(KEY_SIZE)
        .arg("--pbkdf")
        .arg("pbkdf2")
        .arg("--label")
        .arg(label)
        .arg("--uuid")
        .arg(uuid.to_string())
        .arg("--key-file")
        .arg("-")
        .arg(device_path.as_ref())
        .stdin(passphrase)
        .run_and_check()
        .context(format!(
            "Failed to create LUKS2 container on '{}'",
            device_path.as_ref().display()
        ))
}

/// Runs `cryptsetup luksOpen` to open the given LUKS2 device under the given
/// mapper name.
pub fn luks_open(
    device_path: impl AsRef<Path>,
    mapper_name: &str,
    passphrase: &[u8],
) -> Result<(), Error> {
    Dependency::Cryptsetup
        .cmd()
        .arg("luksOpen")
        .arg("--key-file")
        .arg("-")
        .arg(device_path.as_ref())
        .arg(mapper_name)
        .stdin(passphrase)
        .run_and_check()
        .context(format!(
            "Failed to open encrypted device '{}' as '{}'",
            device_path.as_ref().display(),
            mapper_name
        ))
}

/// Runs `cryptsetup luksOpen --token-only`, unlocking through an enrolled
/// token (e.g. a TPM2 policy keyslot) without a passphrase.
pub fn luks_open_token(device_path: impl AsRef<Path>, mapper_name: &str) -> Result<(), Error> {
    Dependency::Cryptsetup
        .cmd()
        .arg("luksOpen")
        .arg("--token-only")
        .arg(device_path.as_ref())
        .arg(mapper_name)
        .run_and_check()
        .context(format!(
            "Failed to open encrypted device '{}' as '{}' via token",
            device_path.as_ref().display(),
            mapper_name
        ))
}

/// Runs `cryptsetup luksClose` on a mapper name taken from a device-mapper
/// enumeration, never on a name guessed from a label.
pub fn luks_close(mapper_name: &str) -> Result<(), Error> {
    Dependency::Cryptsetup
        .cmd()
        .arg("luksClose")
        .arg(mapper_name)
        .run_and_check()
        .context(format!("Failed to close encrypted volume '{mapper_name}'"))
}

/// Runs `systemd-cryptenroll` to enroll a TPM 2.0 policy keyslot bound to the
/// given PCR list.
pub fn enroll_tpm2_pcrs(
    device_path: impl AsRef<Path>,
    pcrs: &str,
    passphrase: &[u8],
) -> Result<(), Error> {
    // systemd-cryptenroll reads the unlocking passphrase from $PASSWORD via
    // a key file; use stdin-backed key file semantics through /dev/stdin.
    Dependency::SystemdCryptenroll
        .cmd()
        .arg("--tpm2-device=auto")
        .arg(format!("--tpm2-pcrs={pcrs}"))
        .arg("--unlock-key-file=/dev/stdin")
        .arg(device_path.as_ref())
        .stdin(passphrase)
        .run_and_check()
        .context(format!(
            "Failed to enroll TPM 2.0 keyslot for '{}'",
            device_path.as_ref().display()
        ))
}

/// Runs `systemd-cryptenroll --wipe-slot=password` so that only the TPM can
/// unlock the device afterwards.
pub fn wipe_password_slot(device_path: impl AsRef<Path>) -> Result<(), Error> {
    Dependency::SystemdCryptenroll
        .cmd()
        .arg("--wipe-slot=password")
        .arg(device_path.as_ref())
        .run_and_check()
        .context(format!(
            "Failed to wipe password keyslot on '{}'",
            device_path.as_ref().display()
        ))
}
