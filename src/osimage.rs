use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
};

use anyhow::{bail, ensure, Context, Error};
use flate2::read::GzDecoder;
use log::{debug, info, warn};
use oci_client::{
    client::ClientConfig, manifest::ImageIndexEntry, secrets::RegistryAuth, Client, Reference,
};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::runtime::Runtime;

use capstan_api::config::{ImageSource, VerifyConfig};
use osutils::dependencies::Dependency;

/// Layer media types the agent understands.
const ACCEPTED_LAYER_TYPES: &[&str] = &[
    "application/vnd.oci.image.layer.v1.tar",
    "application/vnd.oci.image.layer.v1.tar+gzip",
    "application/vnd.oci.image.layer.v1.tar+zstd",
    "application/vnd.docker.image.rootfs.diff.tar",
    "application/vnd.docker.image.rootfs.diff.tar.gzip",
];

/// Annotation carrying the tag of a manifest inside an OCI layout index.
const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// Materialises an image source into the target directory.
///
/// Directory sources are not handled here; the deployer syncs those itself.
pub fn extract(
    source: &ImageSource,
    target: &Path,
    verify: Option<&VerifyConfig>,
) -> Result<(), Error> {
    match source {
        ImageSource::Registry {
            reference,
            platform,
        } => extract_registry(reference, platform, target, verify),
        ImageSource::File(path) => load_archive(path, target),
        ImageSource::Dir(path) => bail!(
            "Directory source '{}' must be synchronised, not extracted",
            path.display()
        ),
    }
}

/// Pulls a registry image and unpacks its layers into the target root.
fn extract_registry(
    reference: &str,
    platform: &str,
    target: &Path,
    verify: Option<&VerifyConfig>,
) -> Result<(), Error> {
    if let Some(verify) = verify {
        verify_signature(reference, verify)?;
    }

    info!("Pulling '{reference}' ({platform})");
    let reference: Reference = reference
        .parse()
        .context(format!("Failed to parse image reference '{reference}'"))?;

    let (os, architecture) = platform.split_once('/').unwrap_or(("linux", platform));
    let os = os.to_owned();
    let architecture = architecture.to_owned();

    let client = Client::new(ClientConfig {
        platform_resolver: Some(Box::new(move |entries: &[ImageIndexEntry]| {
            entries
                .iter()
                .find(|entry| {
                    entry.platform.as_ref().is_some_and(|platform| {
                        platform.os == os && platform.architecture == architecture
                    })
                })
                .map(|entry| entry.digest.clone())
        })),
        ..Default::default()
    });

    // The registry client is async; everything else in the agent is not. Run
    // the pull to completion on a local runtime.
    let runtime = Runtime::new().context("Failed to create async runtime")?;
    let image = runtime
        .block_on(client.pull(
            &reference,
            &RegistryAuth::Anonymous,
            ACCEPTED_LAYER_TYPES.to_vec(),
        ))
        .context(format!("Failed to pull '{reference}'"))?;

    debug!("Pulled {} layers", image.layers.len());

    if let Some(manifest) = &image.manifest {
        for (descriptor, layer) in manifest.layers.iter().zip(&image.layers) {
            verify_digest(&descriptor.digest, &layer.data)?;
        }
    }

    for layer in &image.layers {
        apply_layer(&layer.data, &layer.media_type, target)?;
    }

    Ok(())
}

/// Runs the signature verifier against the reference before anything is
/// pulled. A pinned public key takes precedence over keyless verification.
fn verify_signature(reference: &str, verify: &VerifyConfig) -> Result<(), Error> {
    let mut cmd = Dependency::Cosign.cmd();
    cmd.arg("verify");
    if let Some(public_key) = &verify.public_key {
        cmd.arg("--key").arg(public_key);
    }
    cmd.arg(reference)
        .run_and_check()
        .context(format!("Signature verification failed for '{reference}'"))
}

/// Loads a local archive into the target root. Tries, in order: an OCI layout
/// with a single manifest, an OCI layout with a tagged manifest, and finally a
/// plain tar archive. The first to succeed wins.
pub fn load_archive(path: &Path, target: &Path) -> Result<(), Error> {
    ensure!(path.exists(), "Archive '{}' does not exist", path.display());

    // A layout may arrive as a directory or packed into a tar; stage the
    // latter so both cases read the same way. The staging directory must
    // outlive the layer application below.
    let mut _staged: Option<TempDir> = None;
    let layout_root: Option<PathBuf> = if path.is_dir() {
        path.join("oci-layout").exists().then(|| path.to_path_buf())
    } else {
        match stage_archive(path) {
            Ok(stage) if stage.path().join("oci-layout").exists() => {
                let root = stage.path().to_path_buf();
                _staged = Some(stage);
                Some(root)
            }
            Ok(_) => None,
            Err(e) => {
                debug!(
                    "Archive '{}' is not a tar of an OCI layout: {e:#}",
                    path.display()
                );
                None
            }
        }
    };

    if let Some(root) = layout_root {
        match apply_oci_layout(&root, None, target) {
            Ok(()) => return Ok(()),
            Err(e) => debug!("Not loadable as a single-manifest OCI image: {e:#}"),
        }
        match apply_oci_layout(&root, Some(REF_NAME_ANNOTATION), target) {
            Ok(()) => return Ok(()),
            Err(e) => debug!("Not loadable as a tagged OCI image: {e:#}"),
        }
    }

    debug!("Falling back to plain tar extraction for '{}'", path.display());
    let file = fs::File::open(path).context("Failed to open archive")?;
    unpack_tar(file, target).context(format!(
        "Failed to load '{}' as an OCI image or tar archive",
        path.display()
    ))
}

fn stage_archive(path: &Path) -> Result<TempDir, Error> {
    let stage = TempDir::new().context("Failed to create staging directory")?;
    let file = fs::File::open(path).context("Failed to open archive")?;
    unpack_tar(file, stage.path())?;
    Ok(stage)
}

#[derive(Deserialize)]
struct OciIndex {
    manifests: Vec<OciDescriptor>,
}

#[derive(Deserialize)]
struct OciDescriptor {
    digest: String,
    #[serde(default, rename = "mediaType")]
    media_type: String,
    #[serde(default)]
    annotations: std::collections::BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct OciManifest {
    layers: Vec<OciDescriptor>,
}

/// Applies the layers of one manifest from an OCI layout.
///
/// With `tag_annotation` unset, the index must carry exactly one manifest.
/// With it set, the first manifest carrying that annotation is selected.
fn apply_oci_layout(
    root: &Path,
    tag_annotation: Option<&str>,
    target: &Path,
) -> Result<(), Error> {
    let index: OciIndex = serde_json::from_str(
        &fs::read_to_string(root.join("index.json")).context("Failed to read index.json")?,
    )
    .context("Failed to parse index.json")?;

    let descriptor = match tag_annotation {
        None => {
            ensure!(
                index.manifests.len() == 1,
                "Index holds {} manifests, expected exactly one",
                index.manifests.len()
            );
            &index.manifests[0]
        }
        Some(annotation) => index
            .manifests
            .iter()
            .find(|descriptor| descriptor.annotations.contains_key(annotation))
            .context("No tagged manifest in index")?,
    };

    let manifest: OciManifest =
        serde_json::from_slice(&read_blob(root, &descriptor.digest)?)
            .context("Failed to parse image manifest")?;

    for layer in &manifest.layers {
        let data = read_blob(root, &layer.digest)?;
        verify_digest(&layer.digest, &data)?;
        apply_layer(&data, &layer.media_type, target)?;
    }

    Ok(())
}

fn read_blob(root: &Path, digest: &str) -> Result<Vec<u8>, Error> {
    let (algorithm, hex) = digest
        .split_once(':')
        .context(format!("Malformed digest '{digest}'"))?;
    fs::read(root.join("blobs").join(algorithm).join(hex))
        .context(format!("Failed to read blob '{digest}'"))
}

fn verify_digest(digest: &str, data: &[u8]) -> Result<(), Error> {
    let Some(expected) = digest.strip_prefix("sha256:") else {
        warn!("Skipping verification of digest with unknown algorithm: '{digest}'");
        return Ok(());
    };
    let actual = hex_digest(data);
    ensure!(
        actual == expected,
        "Digest mismatch: expected sha256:{expected}, computed sha256:{actual}"
    );
    Ok(())
}

fn hex_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Unpacks one image layer into the target root, honoring OCI whiteouts.
fn apply_layer(data: &[u8], media_type: &str, target: &Path) -> Result<(), Error> {
    let reader: Box<dyn Read + '_> = if media_type.ends_with("+gzip") || media_type.ends_with(".gzip")
    {
        Box::new(GzDecoder::new(data))
    } else if media_type.ends_with("+zstd") {
        Box::new(zstd::stream::read::Decoder::new(data).context("Failed to open zstd stream")?)
    } else {
        Box::new(data)
    };

    unpack_layer_tar(reader, target)
}

fn unpack_layer_tar(reader: impl Read, target: &Path) -> Result<(), Error> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_unpack_xattrs(true);

    for entry in archive.entries().context("Failed to read layer")? {
        let mut entry = entry.context("Failed to read layer entry")?;
        let path = entry.path().context("Layer entry has invalid path")?;

        let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };

        if let Some(whiteout) = file_name.strip_prefix(".wh.") {
            let parent = path.parent().unwrap_or(Path::new(""));
            if whiteout == ".wh..opq" {
                // Opaque whiteout: the directory starts fresh at this layer
                let dir = target.join(parent);
                if dir.exists() {
                    fs::remove_dir_all(&dir)
                        .context(format!("Failed to clear '{}'", dir.display()))?;
                    fs::create_dir_all(&dir)
                        .context(format!("Failed to recreate '{}'", dir.display()))?;
                }
            } else {
                let victim = target.join(parent).join(whiteout);
                if victim.is_dir() {
                    fs::remove_dir_all(&victim)
                        .context(format!("Failed to remove '{}'", victim.display()))?;
                } else if victim.exists() {
                    fs::remove_file(&victim)
                        .context(format!("Failed to remove '{}'", victim.display()))?;
                }
            }
            continue;
        }

        entry
            .unpack_in(target)
            .context("Failed to unpack layer entry")?;
    }

    Ok(())
}

/// Unpacks a plain tar archive, transparently handling gzip compression.
fn unpack_tar(mut reader: impl Read, target: &Path) -> Result<(), Error> {
    let mut buffered = Vec::new();
    reader
        .read_to_end(&mut buffered)
        .context("Failed to read archive")?;

    let reader: Box<dyn Read + '_> = if buffered.starts_with(&[0x1f, 0x8b]) {
        Box::new(GzDecoder::new(buffered.as_slice()))
    } else {
        Box::new(buffered.as_slice())
    };

    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive
        .unpack(target)
        .context("Failed to unpack tar archive")?;
    Ok(())
}
