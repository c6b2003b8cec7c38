use anyhow::{bail, Context, Error};
use tempfile::TempDir;

use crate::dependencies::Dependency;

/// Checks that a TPM 2.0 device is accessible by reading the PCR banks.
pub fn is_present() -> bool {
    Dependency::Tpm2Pcrread
        .cmd()
        .output()
        .map(|output| output.success())
        .unwrap_or(false)
}

/// Defines the NV index (if needed) and stores the given payload there.
///
/// The payload is hex-encoded before the write so the stored blob survives NV
/// areas that strip trailing zero bytes.
pub fn nv_store(index: &str, payload: &[u8]) -> Result<(), Error> {
    let encoded = hex::encode(payload);

    // Defining an index that already exists fails; undefine best-effort first
    // so repeated provisioning converges.
    let _ = Dependency::Tpm2Nvundefine.cmd().arg(index).output();

    Dependency::Tpm2Nvdefine
        .cmd()
        .arg("--size")
        .arg(encoded.len().to_string())
        .arg(index)
        .run_and_check()
        .context(format!("Failed to define TPM NV index {index}"))?;

    Dependency::Tpm2Nvwrite
        .cmd()
        .arg("--input")
        .arg("-")
        .arg(index)
        .stdin(encoded.into_bytes())
        .run_and_check()
        .context(format!("Failed to write TPM NV index {index}"))
}

/// Reads back a payload previously stored with [`nv_store`].
pub fn nv_read(index: &str) -> Result<Vec<u8>, Error> {
    let output = Dependency::Tpm2Nvread
        .cmd()
        .arg(index)
        .output_and_check()
        .context(format!("Failed to read TPM NV index {index}"))?;

    hex::decode(output.trim())
        .context(format!("TPM NV index {index} does not hold a hex payload"))
}

/// A TPM quote over the given nonce, suitable for a remote attestation
/// exchange.
#[derive(Debug)]
pub struct Quote {
    /// Attestation structure, hex-encoded.
    pub message: String,
    /// Signature over the attestation structure, hex-encoded.
    pub signature: String,
}

/// Produces a quote over the given nonce using the PCR selection the remote
/// side dictates.
pub fn quote(nonce: &str, pcr_selection: &str) -> Result<Quote, Error> {
    if nonce.is_empty() {
        bail!("Attestation nonce must not be empty");
    }

    let workdir = TempDir::new().context("Failed to create quote working directory")?;
    let message_path = workdir.path().join("quote.msg");
    let signature_path = workdir.path().join("quote.sig");

    Dependency::Tpm2Quote
        .cmd()
        .arg("--key-context")
        .arg("owner")
        .arg("--pcr-list")
        .arg(pcr_selection)
        .arg("--qualification")
        .arg(nonce)
        .arg("--message")
        .arg(&message_path)
        .arg("--signature")
        .arg(&signature_path)
        .run_and_check()
        .context("Failed to produce TPM quote")?;

    let message = std::fs::read(&message_path).context("Failed to read quote message")?;
    let signature = std::fs::read(&signature_path).context("Failed to read quote signature")?;

    Ok(Quote {
        message: hex::encode(message),
        signature: hex::encode(signature),
    })
}
