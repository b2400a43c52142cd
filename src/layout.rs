//! # Layout Module
//!
//! Single source of truth for where DeskPulse lives on a machine.
//!
//! There are exactly two durable trees, and they are deliberately disjoint:
//!
//! 1. **Program directory** - immutable application files, overwritten on every
//!    install/upgrade, removed unconditionally on uninstall.
//!    Default: `%LOCALAPPDATA%\Programs\DeskPulse` (Windows) or
//!    `~/.local/share/Programs/DeskPulse` (elsewhere).
//! 2. **User-data directory** - config, posture database, logs. Never touched by
//!    install or upgrade; removed on uninstall only with explicit consent.
//!    Default: `%APPDATA%\DeskPulse` (Windows) or `~/.local/share/DeskPulse`.
//!
//! The disjointness of these two trees is what makes "upgrade never destroys
//! user data" a structural guarantee instead of a hope. Every destructive
//! operation asserts it first.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::invariant_ppt::assert_invariant;

/// Product name used for directory names, shortcuts, and report headers.
pub const PRODUCT_NAME: &str = "DeskPulse";

/// File name of the user configuration inside the data directory.
pub const CONFIG_FILE: &str = "config.json";

/// File name of the posture-event database inside the data directory.
pub const DATABASE_FILE: &str = "deskpulse.db";

/// File name of the install receipt inside the program directory.
pub const RECEIPT_FILE: &str = "install-receipt.json";

/// Resolved filesystem layout for one invocation.
///
/// Both roots can be overridden per-invocation (tests, portable setups);
/// the defaults come from the platform conventions via `directories`.
#[derive(Debug, Clone)]
pub struct Layout {
    pub program_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl Layout {
    /// Resolves the layout, applying CLI overrides where given.
    pub fn resolve(program_dir: Option<&Path>, data_dir: Option<&Path>) -> Result<Self> {
        let layout = match (program_dir, data_dir) {
            (Some(p), Some(d)) => Layout {
                program_dir: p.to_path_buf(),
                data_dir: d.to_path_buf(),
            },
            _ => {
                let base = directories::BaseDirs::new()
                    .context("could not determine user directories for this account")?;
                Layout {
                    program_dir: program_dir.map(Path::to_path_buf).unwrap_or_else(|| {
                        base.data_local_dir().join("Programs").join(PRODUCT_NAME)
                    }),
                    data_dir: data_dir
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| base.data_dir().join(PRODUCT_NAME)),
                }
            }
        };
        Ok(layout)
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join(CONFIG_FILE)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn receipt_path(&self) -> PathBuf {
        self.program_dir.join(RECEIPT_FILE)
    }

    /// Verifies that the program tree and the user-data tree do not overlap.
    ///
    /// Called before every destructive operation (install swap, uninstall).
    /// A violated layout means deleting the program directory could take user
    /// data with it, so this is a hard error, never a warning.
    pub fn assert_disjoint(&self) -> Result<()> {
        let disjoint = trees_disjoint(&self.program_dir, &self.data_dir);
        assert_invariant(
            disjoint,
            "program directory and user-data directory must be disjoint",
            Some("Layout"),
        );
        if !disjoint {
            bail!(
                "refusing to proceed: program dir {} and data dir {} overlap",
                self.program_dir.display(),
                self.data_dir.display()
            );
        }
        Ok(())
    }
}

/// True when neither tree is a prefix of the other.
///
/// Comparison is component-wise on the lexical paths (the directories may not
/// exist yet), with `.` and `..` components resolved first so `root/sub/..`
/// and `root/data` compare as the overlapping trees they really are. Windows
/// paths compare case-insensitively.
pub fn trees_disjoint(a: &Path, b: &Path) -> bool {
    let a = normalize(a);
    let b = normalize(b);
    a != b && !a.starts_with(&b) && !b.starts_with(&a)
}

fn normalize(p: &Path) -> PathBuf {
    use std::path::Component;

    let mut out = PathBuf::new();
    for comp in p.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                match out.components().next_back() {
                    // `a/b/..` collapses to `a`.
                    Some(Component::Normal(_)) => {
                        out.pop();
                    }
                    // `/..` stays `/`; there is nothing above the root.
                    Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                    // A relative path may keep leading `..` components.
                    _ => out.push(".."),
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if cfg!(windows) {
        PathBuf::from(out.to_string_lossy().to_lowercase())
    } else {
        out
    }
}
