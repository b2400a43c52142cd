//! # Install State
//!
//! The lifecycle of a machine is a small state machine:
//!
//! ```text
//! NotInstalled -> Installed -> (Upgraded | Uninstalled-DataKept | Uninstalled-DataDeleted)
//! ```
//!
//! The `Installed` state is materialized as a receipt file inside the program
//! directory. Because the receipt lives in the program tree, removing the
//! program directory removes the state with it, and a missing receipt *is*
//! the `NotInstalled` state. No registry, no side database.
//!
//! The receipt records the installed version, the shortcut tasks that were
//! selected, a content hash for every installed file, and the data-preservation
//! prompt text that was embedded at installer-compile time.

use std::fs;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use semver::Version;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::layout::Layout;

/// One installed (or bundled) file: path relative to the tree root, byte size,
/// and a SHA-256 content hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEntry {
    pub rel: String,
    pub size: u64,
    pub sha256: String,
}

/// Install-time task selection. Desktop shortcut defaults on, auto-start
/// defaults off, mirroring the installer dialogs of the shipped product.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tasks {
    #[serde(default = "default_true")]
    pub start_menu_shortcut: bool,
    #[serde(default = "default_true")]
    pub desktop_shortcut: bool,
    #[serde(default)]
    pub autostart: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Tasks {
    fn default() -> Self {
        Tasks {
            start_menu_shortcut: true,
            desktop_shortcut: true,
            autostart: false,
        }
    }
}

/// The durable record of an `Installed` state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Receipt {
    pub product: String,
    pub version: String,
    pub installed_at: String,
    pub entry_point: String,
    pub tasks: Tasks,
    /// Prompt text shown at uninstall time before deleting user data.
    /// `{dir}` is replaced with the actual data directory.
    pub preserve_prompt: String,
    pub files: Vec<FileEntry>,
}

/// Current machine state, derived purely from the filesystem.
#[derive(Debug, Clone)]
pub enum InstallState {
    NotInstalled,
    Installed(Receipt),
}

/// Reads the machine state for a layout. A program directory without a
/// readable receipt is treated as corrupt, not as `NotInstalled`, so the
/// caller can surface it instead of silently clobbering it.
pub fn detect(layout: &Layout) -> Result<InstallState> {
    let receipt_path = layout.receipt_path();
    if !receipt_path.exists() {
        return Ok(InstallState::NotInstalled);
    }
    Ok(InstallState::Installed(read_receipt(&receipt_path)?))
}

pub fn read_receipt(path: &Path) -> Result<Receipt> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read receipt {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse receipt {}", path.display()))
}

pub fn write_receipt(path: &Path, receipt: &Receipt) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let contents = serde_json::to_string_pretty(receipt).context("serialize receipt")?;
    fs::write(path, contents).with_context(|| format!("write receipt {}", path.display()))?;
    Ok(())
}

/// Relation of an installed version to an incoming package version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionRelation {
    /// Same version: a reinstall, must be idempotent.
    Same,
    /// Incoming is older than installed: a downgrade, refused.
    Downgrade,
    /// Incoming is newer: an upgrade.
    Upgrade,
    /// One side is not valid semver; proceed, but loudly.
    Unknown,
}

pub fn compare_versions(installed: &str, incoming: &str) -> VersionRelation {
    if installed.trim() == incoming.trim() {
        return VersionRelation::Same;
    }
    match (
        Version::parse(installed.trim()),
        Version::parse(incoming.trim()),
    ) {
        (Ok(installed), Ok(incoming)) => match incoming.cmp(&installed) {
            std::cmp::Ordering::Greater => VersionRelation::Upgrade,
            std::cmp::Ordering::Less => VersionRelation::Downgrade,
            std::cmp::Ordering::Equal => VersionRelation::Same,
        },
        _ => VersionRelation::Unknown,
    }
}

/// SHA-256 of a file's contents, lowercase hex.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

/// Hashes every regular file under `root`, sorted by relative path so the
/// result is deterministic. Relative paths always use `/` separators so the
/// same tree hashes identically on every platform.
pub fn hash_tree(root: &Path) -> Result<Vec<FileEntry>> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let meta = entry
            .metadata()
            .with_context(|| format!("metadata {}", entry.path().display()))?;
        entries.push(FileEntry {
            rel,
            size: meta.len(),
            sha256: sha256_file(entry.path())?,
        });
    }
    entries.sort_by(|a, b| a.rel.cmp(&b.rel));
    Ok(entries)
}
