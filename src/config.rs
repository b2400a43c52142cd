//! # User Configuration
//!
//! `config.json` in the user-data directory is owned by the running DeskPulse
//! app, not by this tool. The lifecycle tool touches it in exactly two places:
//!
//! - `install --seed-config` writes the default file, and only if nothing is
//!   there yet (so an upgrade can never clobber user preferences);
//! - `doctor` parses it to report whether it is still valid JSON.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Backend the desktop client talks to when no user override exists.
pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8765";

/// The subset of the app configuration this tool understands. Unknown fields
/// written by newer app versions are preserved on read and ignored here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    pub backend_url: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
        }
    }
}

/// Writes the default config if and only if `path` does not exist.
///
/// Returns `true` when a file was written. The only-if-absent rule is what
/// keeps this safe to call on every install, including upgrades.
pub fn ensure_default(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let contents =
        serde_json::to_string_pretty(&AppConfig::default()).context("serialize default config")?;
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))?;
    Ok(true)
}

/// Parses the config, tolerating fields this tool doesn't know about.
pub fn load(path: &Path) -> Result<AppConfig> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&raw).with_context(|| format!("{} is not valid JSON", path.display()))?;
    let backend_url = value
        .get("backend_url")
        .and_then(|v| v.as_str())
        .with_context(|| format!("{} has no backend_url field", path.display()))?
        .to_string();
    Ok(AppConfig { backend_url })
}
