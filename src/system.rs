//! # System Integration
//!
//! Everything that touches the OS outside the two DeskPulse trees lives
//! behind the `SystemOps` trait: launch shortcuts, auto-start registration,
//! and the uninstall confirmation prompt. This keeps the lifecycle logic
//! testable with `MockSystem` - no test ever writes a real Start Menu entry
//! or waits on a terminal.
//!
//! Shortcut and auto-start failures are surfaced as warnings by the callers,
//! never as install failures: a missing desktop icon is an annoyance, a
//! half-installed program directory is not.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

#[cfg(not(windows))]
use std::fs;

/// Where a launch shortcut goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortcutLocation {
    StartMenu,
    Desktop,
}

/// Abstraction over the host OS surfaces the installer touches.
pub trait SystemOps {
    /// Creates (or overwrites) a launch shortcut, returning its path.
    fn create_shortcut(
        &self,
        location: ShortcutLocation,
        name: &str,
        target: &Path,
    ) -> Result<PathBuf>;

    /// Removes a shortcut if present. Returns whether one existed.
    fn remove_shortcut(&self, location: ShortcutLocation, name: &str) -> Result<bool>;

    /// Registers the app to start at login.
    fn register_autostart(&self, name: &str, target: &Path) -> Result<()>;

    /// Removes the auto-start registration if present. Returns whether one existed.
    fn unregister_autostart(&self, name: &str) -> Result<bool>;

    /// Whether a human is attached to stdin (gates the uninstall prompt).
    fn is_interactive(&self) -> bool;

    /// Asks a yes/no question. Only called when `is_interactive()` is true.
    fn confirm(&self, prompt: &str) -> Result<bool>;
}

/// The real host implementation (Production).
pub struct HostSystem;

impl SystemOps for HostSystem {
    fn create_shortcut(
        &self,
        location: ShortcutLocation,
        name: &str,
        target: &Path,
    ) -> Result<PathBuf> {
        if name.is_empty() {
            bail!("shortcut name is empty");
        }
        let dir = shortcut_dir(location)?;
        std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        write_shortcut(&dir, name, target)
    }

    fn remove_shortcut(&self, location: ShortcutLocation, name: &str) -> Result<bool> {
        if name.is_empty() {
            bail!("shortcut name is empty");
        }
        let path = shortcut_dir(location)?.join(shortcut_file_name(name));
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
        Ok(true)
    }

    #[cfg(windows)]
    fn register_autostart(&self, name: &str, target: &Path) -> Result<()> {
        let key = windows_registry::CURRENT_USER
            .create(RUN_KEY)
            .context("open HKCU Run key")?;
        key.set_string(name, &format!("\"{}\"", target.display()))
            .context("write HKCU Run value")?;
        Ok(())
    }

    #[cfg(not(windows))]
    fn register_autostart(&self, name: &str, target: &Path) -> Result<()> {
        let dir = autostart_dir()?;
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        write_desktop_entry(&dir.join(format!("{name}.desktop")), name, target)?;
        Ok(())
    }

    #[cfg(windows)]
    fn unregister_autostart(&self, name: &str) -> Result<bool> {
        let key = windows_registry::CURRENT_USER
            .create(RUN_KEY)
            .context("open HKCU Run key")?;
        if key.get_string(name).is_err() {
            return Ok(false);
        }
        key.remove_value(name).context("remove HKCU Run value")?;
        Ok(true)
    }

    #[cfg(not(windows))]
    fn unregister_autostart(&self, name: &str) -> Result<bool> {
        let path = autostart_dir()?.join(format!("{name}.desktop"));
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
        Ok(true)
    }

    fn is_interactive(&self) -> bool {
        std::io::stdin().is_terminal()
    }

    fn confirm(&self, prompt: &str) -> Result<bool> {
        let answer = dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .context("read confirmation")?;
        Ok(answer)
    }
}

#[cfg(windows)]
const RUN_KEY: &str = r"Software\Microsoft\Windows\CurrentVersion\Run";

fn shortcut_file_name(name: &str) -> String {
    if cfg!(windows) {
        format!("{name}.lnk")
    } else {
        format!("{name}.desktop")
    }
}

#[cfg(windows)]
fn shortcut_dir(location: ShortcutLocation) -> Result<PathBuf> {
    match location {
        ShortcutLocation::StartMenu => {
            let appdata = std::env::var("APPDATA").context("APPDATA not set")?;
            Ok(PathBuf::from(appdata)
                .join("Microsoft")
                .join("Windows")
                .join("Start Menu")
                .join("Programs"))
        }
        ShortcutLocation::Desktop => {
            let dirs = directories::UserDirs::new().context("could not determine user directories")?;
            let desktop = dirs.desktop_dir().context("no desktop directory")?;
            Ok(desktop.to_path_buf())
        }
    }
}

#[cfg(not(windows))]
fn shortcut_dir(location: ShortcutLocation) -> Result<PathBuf> {
    match location {
        ShortcutLocation::StartMenu => {
            let dirs = directories::BaseDirs::new().context("could not determine user directories")?;
            Ok(dirs.data_dir().join("applications"))
        }
        ShortcutLocation::Desktop => {
            let dirs = directories::UserDirs::new().context("could not determine user directories")?;
            match dirs.desktop_dir() {
                Some(d) => Ok(d.to_path_buf()),
                None => Ok(dirs.home_dir().join("Desktop")),
            }
        }
    }
}

/// Windows shortcuts are real `.lnk` files, created through the WScript.Shell
/// COM object via PowerShell - the one reliable way to do it without pulling
/// in a COM binding.
#[cfg(windows)]
fn write_shortcut(dir: &Path, name: &str, target: &Path) -> Result<PathBuf> {
    use std::process::Command;

    let lnk_path = dir.join(shortcut_file_name(name));
    let lnk = ps_quote(&lnk_path.display().to_string());
    let tgt = ps_quote(&target.display().to_string());
    let script = format!(
        "$WshShell = New-Object -ComObject WScript.Shell; \
         $Shortcut = $WshShell.CreateShortcut({lnk}); \
         $Shortcut.TargetPath = {tgt}; \
         $Shortcut.Save();"
    );

    let status = Command::new("powershell")
        .arg("-NoProfile")
        .arg("-Command")
        .arg(script)
        .status()
        .context("run powershell")?;
    if !status.success() {
        bail!("failed to create shortcut (exit {:?})", status.code());
    }
    Ok(lnk_path)
}

#[cfg(not(windows))]
fn write_shortcut(dir: &Path, name: &str, target: &Path) -> Result<PathBuf> {
    let path = dir.join(shortcut_file_name(name));
    write_desktop_entry(&path, name, target)?;
    Ok(path)
}

#[cfg(not(windows))]
fn write_desktop_entry(path: &Path, name: &str, target: &Path) -> Result<()> {
    let contents = format!(
        "[Desktop Entry]\nType=Application\nName={name}\nExec=\"{}\"\nTerminal=false\n",
        target.display()
    );
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

#[cfg(not(windows))]
fn autostart_dir() -> Result<PathBuf> {
    let dirs = directories::BaseDirs::new().context("could not determine user directories")?;
    Ok(dirs.config_dir().join("autostart"))
}

#[cfg(windows)]
fn ps_quote(value: &str) -> String {
    let escaped = value.replace('\'', "''");
    format!("'{}'", escaped)
}

/// A Mock System for Testing.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MockSystem {
    pub shortcuts: std::sync::Mutex<Vec<(ShortcutLocation, String, PathBuf)>>,
    pub autostart: std::sync::Mutex<std::collections::HashMap<String, PathBuf>>,
    pub autostart_unregisters: std::sync::Mutex<u32>,
    pub prompts: std::sync::Mutex<Vec<String>>,
    pub interactive: bool,
    pub confirm_answer: bool,
}

#[cfg(test)]
impl MockSystem {
    pub fn interactive(answer: bool) -> Self {
        MockSystem {
            interactive: true,
            confirm_answer: answer,
            ..Default::default()
        }
    }

    pub fn shortcut_names(&self) -> Vec<String> {
        self.shortcuts
            .lock()
            .unwrap()
            .iter()
            .map(|(_, name, _)| name.clone())
            .collect()
    }
}

#[cfg(test)]
impl SystemOps for MockSystem {
    fn create_shortcut(
        &self,
        location: ShortcutLocation,
        name: &str,
        target: &Path,
    ) -> Result<PathBuf> {
        if name.is_empty() {
            bail!("shortcut name is empty");
        }
        let mut shortcuts = self.shortcuts.lock().unwrap();
        shortcuts.retain(|(loc, n, _)| !(*loc == location && n == name));
        shortcuts.push((location, name.to_string(), target.to_path_buf()));
        Ok(PathBuf::from(format!("mock://{name}")))
    }

    fn remove_shortcut(&self, location: ShortcutLocation, name: &str) -> Result<bool> {
        let mut shortcuts = self.shortcuts.lock().unwrap();
        let before = shortcuts.len();
        shortcuts.retain(|(loc, n, _)| !(*loc == location && n == name));
        Ok(shortcuts.len() != before)
    }

    fn register_autostart(&self, name: &str, target: &Path) -> Result<()> {
        self.autostart
            .lock()
            .unwrap()
            .insert(name.to_string(), target.to_path_buf());
        Ok(())
    }

    fn unregister_autostart(&self, name: &str) -> Result<bool> {
        *self.autostart_unregisters.lock().unwrap() += 1;
        Ok(self.autostart.lock().unwrap().remove(name).is_some())
    }

    fn is_interactive(&self) -> bool {
        self.interactive
    }

    fn confirm(&self, prompt: &str) -> Result<bool> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok(self.confirm_answer)
    }
}
