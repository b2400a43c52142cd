//! # Bundle Construction
//!
//! Turns the application source tree into an interpreter-free bundle
//! directory, driven entirely by a version-controlled manifest file. Automatic
//! dependency discovery is treated as an untrusted heuristic: the manifest's
//! explicit include list is the source of truth for anything the copy rules
//! might drop, and a post-build size assertion guards against a bundle that
//! silently lost its native dependencies.
//!
//! The bundle stage also writes `bundle.json` at the bundle root: product,
//! version, entry point, default install tasks, and a content hash for every
//! bundled file. The installer-compilation stage refuses to run without it.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::invariant_ppt::assert_invariant;
use crate::state::{FileEntry, Tasks, hash_tree};

/// Name of the content index written at the bundle root.
pub const BUNDLE_INDEX_NAME: &str = "bundle.json";

/// Uninstall-time prompt used when the manifest does not override it.
/// `{dir}` is replaced with the user-data directory on the target machine.
pub const DEFAULT_PRESERVE_PROMPT: &str =
    "Also delete your DeskPulse data (settings, posture history, logs) at {dir}? This cannot be undone";

/// Acceptable output range for a finished bundle.
///
/// Falling below the minimum means the copy rules dropped something required
/// (usually a native dependency tree) and the bundle would fail at runtime on
/// the target machine, where it is unrecoverable without a rebuild. That makes
/// "too small" a hard build error. "Too large" only warrants investigation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SizeRange {
    pub min_bytes: u64,
    pub max_bytes: u64,
    pub min_files: u64,
}

/// The version-controlled bundle manifest, reviewed by a human whenever the
/// application's dependencies change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleManifest {
    pub product: String,
    pub version: String,
    /// Launcher file, relative to the bundle root (e.g. `DeskPulse.exe`).
    pub entry_point: String,
    /// Paths that MUST land in the bundle even if the exclude rules or the
    /// copy heuristics would drop them.
    #[serde(default)]
    pub include: Vec<String>,
    /// Path prefixes or single components to leave out (caches, tests,
    /// irrelevant native backends). Keeps the bundle inside its size range.
    #[serde(default)]
    pub exclude: Vec<String>,
    pub expected: SizeRange,
    #[serde(default)]
    pub default_tasks: Tasks,
    #[serde(default)]
    pub preserve_prompt: Option<String>,
}

pub fn load_manifest(path: &Path) -> Result<BundleManifest> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read bundle manifest {}", path.display()))?;
    let manifest: BundleManifest = serde_json::from_str(&raw)
        .with_context(|| format!("parse bundle manifest {}", path.display()))?;
    if manifest.product.trim().is_empty() {
        bail!("bundle manifest {}: product is empty", path.display());
    }
    if manifest.entry_point.trim().is_empty() {
        bail!("bundle manifest {}: entry_point is empty", path.display());
    }
    Ok(manifest)
}

/// Index written to `bundle.json` and later embedded into the installer
/// artifact as its metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleIndex {
    pub product: String,
    pub version: String,
    pub entry_point: String,
    pub default_tasks: Tasks,
    pub preserve_prompt: String,
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Clone)]
pub struct BundleReport {
    pub file_count: u64,
    pub total_bytes: u64,
}

/// Builds the bundle directory from `source` into `out`.
///
/// `out` is cleaned first, so rebuilding is idempotent at the directory level.
/// The user never has to wonder whether stale files from a previous build are
/// hiding in the output.
pub fn build(source: &Path, manifest: &BundleManifest, out: &Path) -> Result<BundleReport> {
    if !source.is_dir() {
        bail!("bundle source directory not found: {}", source.display());
    }
    let entry = source.join(&manifest.entry_point);
    if !entry.is_file() {
        bail!(
            "entry-point launcher not found: {} (bundle manifest entry_point)",
            entry.display()
        );
    }

    // The root-level index name belongs to this tool; a payload file there
    // would be overwritten by the index and then fail hash verification on
    // every install of the compiled package.
    if manifest
        .include
        .iter()
        .any(|inc| Path::new(inc) == Path::new(BUNDLE_INDEX_NAME))
    {
        bail!(
            "the include list may not contain {BUNDLE_INDEX_NAME}; that name is reserved for the bundle index"
        );
    }

    // Clean-before-build.
    if out.exists() {
        fs::remove_dir_all(out).with_context(|| format!("clean {}", out.display()))?;
    }
    fs::create_dir_all(out).with_context(|| format!("create {}", out.display()))?;

    for entry in walkdir::WalkDir::new(source)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(source).unwrap_or(entry.path());
        if rel == Path::new(BUNDLE_INDEX_NAME) {
            warn!(
                "source tree has a root-level {BUNDLE_INDEX_NAME}; that name is reserved for the bundle index, skipping it"
            );
            continue;
        }
        if is_excluded(rel, &manifest.exclude) && !is_forced(rel, &manifest.include) {
            debug!("excluded: {}", rel.display());
            continue;
        }
        copy_into(entry.path(), rel, out)?;
    }

    // The include list wins over everything: copy any forced entry the walk
    // above did not produce, and fail loudly when one is missing at the
    // source. A missing forced module is unrecoverable on the target machine.
    let mut missing = Vec::new();
    for inc in &manifest.include {
        let rel = PathBuf::from(inc);
        let src = source.join(&rel);
        let dst = out.join(&rel);
        if dst.exists() {
            continue;
        }
        if src.is_file() {
            copy_into(&src, &rel, out)?;
        } else if src.is_dir() {
            for e in walkdir::WalkDir::new(&src).into_iter().filter_map(|e| e.ok()) {
                if e.file_type().is_file() {
                    let r = e.path().strip_prefix(source).unwrap_or(e.path());
                    copy_into(e.path(), r, out)?;
                }
            }
        } else {
            missing.push(inc.clone());
        }
    }
    if !missing.is_empty() {
        bail!(
            "include list entries missing from source tree: {}",
            missing.join(", ")
        );
    }

    // Hash before writing the index so the index never lists itself.
    let files = hash_tree(out)?;
    let total_bytes: u64 = files.iter().map(|f| f.size).sum();
    let file_count = files.len() as u64;

    let plausible =
        total_bytes >= manifest.expected.min_bytes && file_count >= manifest.expected.min_files;
    if !plausible {
        bail!(
            "bundle is implausibly small ({} files, {} bytes; expected at least {} files, {} bytes) \
             - required native dependencies were likely dropped, review the include list",
            file_count,
            total_bytes,
            manifest.expected.min_files,
            manifest.expected.min_bytes
        );
    }
    // Recorded so contract tests can prove the plausibility gate ran.
    assert_invariant(
        plausible,
        "bundle size within plausible range",
        Some("Bundle"),
    );
    if total_bytes > manifest.expected.max_bytes {
        warn!(
            "bundle is larger than expected ({} bytes > {} bytes) - check for accidentally bundled modules",
            total_bytes, manifest.expected.max_bytes
        );
    }

    let index = BundleIndex {
        product: manifest.product.clone(),
        version: manifest.version.clone(),
        entry_point: manifest.entry_point.clone(),
        default_tasks: manifest.default_tasks,
        preserve_prompt: manifest
            .preserve_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_PRESERVE_PROMPT.to_string()),
        files,
    };
    let index_path = out.join(BUNDLE_INDEX_NAME);
    fs::write(
        &index_path,
        serde_json::to_string_pretty(&index).context("serialize bundle index")?,
    )
    .with_context(|| format!("write {}", index_path.display()))?;

    info!(
        "bundled {} {}: {} files, {} bytes -> {}",
        index.product,
        index.version,
        file_count,
        total_bytes,
        out.display()
    );
    Ok(BundleReport {
        file_count,
        total_bytes,
    })
}

pub fn read_index(bundle_dir: &Path) -> Result<BundleIndex> {
    let path = bundle_dir.join(BUNDLE_INDEX_NAME);
    if !path.exists() {
        bail!(
            "no {} found in {} - run the bundle stage before compiling an installer",
            BUNDLE_INDEX_NAME,
            bundle_dir.display()
        );
    }
    let raw = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

/// A path is excluded when any exclude pattern matches one of its components
/// (`__pycache__`) or is a prefix of the relative path (`app/tests`).
fn is_excluded(rel: &Path, excludes: &[String]) -> bool {
    for pattern in excludes {
        let as_path = Path::new(pattern);
        if rel.starts_with(as_path) {
            return true;
        }
        if !pattern.contains('/') {
            let hit = rel.components().any(|c| match c {
                Component::Normal(os) => os.to_string_lossy() == pattern.as_str(),
                _ => false,
            });
            if hit {
                return true;
            }
        }
    }
    false
}

fn is_forced(rel: &Path, includes: &[String]) -> bool {
    includes
        .iter()
        .any(|inc| rel.starts_with(Path::new(inc)))
}

fn copy_into(src: &Path, rel: &Path, out: &Path) -> Result<()> {
    let dest = out.join(rel);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::copy(src, &dest)
        .with_context(|| format!("copy {} -> {}", src.display(), dest.display()))?;
    Ok(())
}
