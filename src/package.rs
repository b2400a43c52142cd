//! # Installer Compilation
//!
//! Wraps a finished bundle into a single compressed, distributable artifact:
//! a gzip-compressed tar containing every bundled file plus an embedded
//! `installer.json`. The metadata carries everything install and uninstall
//! need on the target machine (version, entry point, default tasks, the
//! data-preservation prompt text), so the artifact is self-contained and
//! independent of the build machine.
//!
//! The bundle stage must have run first; a bundle directory without its
//! `bundle.json` index is a fatal missing-input error, not something this
//! stage papers over.

use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result, bail};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use log::{info, warn};

use crate::bundle::{self, BundleIndex};

/// Name of the metadata entry inside the installer artifact.
pub const PACKAGE_METADATA_NAME: &str = "installer.json";

/// Artifact size above which compilation warns. A posture-monitoring client
/// with its vision stack lands well under this; exceeding it historically
/// meant an accidentally bundled GPU backend or test corpus.
pub const DEFAULT_MAX_ARTIFACT_BYTES: u64 = 400 * 1024 * 1024;

/// Compiles the bundle at `bundle_dir` into a single installer file at `out`.
pub fn compile(bundle_dir: &Path, out: &Path, max_artifact_bytes: u64) -> Result<BundleIndex> {
    let index = bundle::read_index(bundle_dir)?;

    let entry = bundle_dir.join(&index.entry_point);
    if !entry.is_file() {
        bail!(
            "bundle at {} is missing its entry point {}",
            bundle_dir.display(),
            index.entry_point
        );
    }
    // Refuse to ship a bundle that no longer matches its own index.
    for file in &index.files {
        if !bundle_dir.join(&file.rel).is_file() {
            bail!(
                "bundle at {} is missing indexed file {} - rebuild the bundle",
                bundle_dir.display(),
                file.rel
            );
        }
    }

    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let writer = File::create(out).with_context(|| format!("create {}", out.display()))?;
    let encoder = GzEncoder::new(writer, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let metadata = serde_json::to_vec_pretty(&index).context("serialize installer metadata")?;
    let mut header = tar::Header::new_gnu();
    header.set_size(metadata.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, PACKAGE_METADATA_NAME, metadata.as_slice())
        .context("append installer metadata")?;

    for file in &index.files {
        let abs = bundle_dir.join(&file.rel);
        builder
            .append_path_with_name(&abs, &file.rel)
            .with_context(|| format!("pack {}", file.rel))?;
    }

    let encoder = builder.into_inner().context("finish tar stream")?;
    encoder.finish().context("finish gzip stream")?;

    let artifact_bytes = fs::metadata(out)
        .with_context(|| format!("stat {}", out.display()))?
        .len();
    if artifact_bytes > max_artifact_bytes {
        warn!(
            "installer artifact is {} bytes (bound {} bytes) - investigate accidentally bundled modules",
            artifact_bytes, max_artifact_bytes
        );
    }
    info!(
        "compiled {} {} installer: {} files, {} bytes -> {}",
        index.product,
        index.version,
        index.files.len(),
        artifact_bytes,
        out.display()
    );
    Ok(index)
}

/// Reads the embedded metadata out of an installer artifact without
/// extracting the payload.
pub fn read_metadata(package: &Path) -> Result<BundleIndex> {
    let file = File::open(package)
        .with_context(|| format!("open installer package {}", package.display()))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    for entry in archive.entries().context("read installer package")? {
        let mut entry = entry.context("read installer entry")?;
        let path = entry.path().context("installer entry path")?;
        if path.as_os_str() == PACKAGE_METADATA_NAME {
            let mut raw = String::new();
            entry
                .read_to_string(&mut raw)
                .context("read installer metadata")?;
            return serde_json::from_str(&raw).context("parse installer metadata");
        }
    }
    bail!(
        "{} is not a DeskPulse installer package (no {} inside)",
        package.display(),
        PACKAGE_METADATA_NAME
    );
}

/// Unpacks the payload (everything except the metadata entry) into `dest`.
///
/// `unpack_in` refuses entries that would escape `dest`, so a malformed
/// archive cannot write outside the staging directory.
pub fn extract(package: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).with_context(|| format!("create {}", dest.display()))?;
    let file = File::open(package)
        .with_context(|| format!("open installer package {}", package.display()))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    for entry in archive.entries().context("read installer package")? {
        let mut entry = entry.context("read installer entry")?;
        let path = entry.path().context("installer entry path")?;
        if path.as_os_str() == PACKAGE_METADATA_NAME {
            continue;
        }
        entry
            .unpack_in(dest)
            .with_context(|| format!("extract into {}", dest.display()))?;
    }
    Ok(())
}
