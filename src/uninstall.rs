//! # Uninstall
//!
//! Drives the `Installed -> Uninstalled-*` transitions. Program files and
//! shortcuts go unconditionally; the user-data directory is gated by an
//! explicit yes/no decision, with "keep" as the safe default everywhere a
//! human isn't present to answer.
//!
//! Purging user data deletes entry by entry and reports every failure
//! individually. A file held open by a still-running DeskPulse process does
//! not abort the purge and is not rolled back: partial deletion is an accepted
//! terminal state, the user is told exactly what is left and where.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use log::{info, warn};
use walkdir::WalkDir;

use crate::layout::Layout;
use crate::state::{self, InstallState};
use crate::system::{ShortcutLocation, SystemOps};

/// How to handle the user-data directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDecision {
    /// Keep data (explicit `--keep-data`).
    Keep,
    /// Delete data without asking (explicit `--purge-data`).
    Purge,
    /// Ask interactively; keep when no terminal is attached.
    Ask,
}

/// What happened to the user-data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataOutcome {
    /// No data directory existed.
    NotPresent,
    /// Kept at the given location for a future reinstall.
    Kept(PathBuf),
    /// Fully deleted.
    Purged,
    /// Some entries could not be deleted; each failure is (path, cause).
    PartiallyPurged { failures: Vec<(PathBuf, String)> },
}

#[derive(Debug, Clone)]
pub struct UninstallReport {
    pub program_removed: bool,
    pub data: DataOutcome,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UninstallOptions {
    /// Leave shortcuts and auto-start entries untouched. For scripted runs
    /// against overridden directories, where the host's entries (if any)
    /// belong to a different installation.
    pub skip_tasks: bool,
}

pub fn uninstall(
    layout: &Layout,
    system: &impl SystemOps,
    decision: DataDecision,
    opts: &UninstallOptions,
) -> Result<UninstallReport> {
    layout.assert_disjoint()?;

    // The receipt (when readable) supplies the product name and the prompt
    // text embedded at installer-compile time. A wrecked receipt must not
    // block an uninstall, so fall back to built-in defaults.
    let receipt = match state::detect(layout) {
        Ok(InstallState::Installed(receipt)) => Some(receipt),
        Ok(InstallState::NotInstalled) => None,
        Err(err) => {
            warn!("install receipt unreadable, continuing with defaults: {err:#}");
            None
        }
    };
    let product = receipt
        .as_ref()
        .map(|r| r.product.clone())
        .unwrap_or_else(|| crate::layout::PRODUCT_NAME.to_string());

    // Shortcuts and auto-start go first, unconditionally. Absence is fine.
    if opts.skip_tasks {
        info!("leaving shortcuts and auto-start entries in place (--skip-tasks)");
    } else {
        for location in [ShortcutLocation::StartMenu, ShortcutLocation::Desktop] {
            match system.remove_shortcut(location, &product) {
                Ok(true) => info!("removed {location:?} shortcut"),
                Ok(false) => {}
                Err(err) => warn!("could not remove {location:?} shortcut: {err:#}"),
            }
        }
        match system.unregister_autostart(&product) {
            Ok(true) => info!("removed auto-start registration"),
            Ok(false) => {}
            Err(err) => warn!("could not remove auto-start registration: {err:#}"),
        }
    }

    // Program directory: unconditional, and a failure here is fatal because
    // leaving half a program tree means the machine is in no defined state.
    let program_removed = if layout.program_dir.exists() {
        fs::remove_dir_all(&layout.program_dir)
            .with_context(|| format!("remove program directory {}", layout.program_dir.display()))?;
        info!("removed program directory {}", layout.program_dir.display());
        true
    } else {
        info!("program directory not present, nothing to remove");
        false
    };

    // User data: gated.
    let data = if !layout.data_dir.exists() {
        DataOutcome::NotPresent
    } else {
        let purge = match decision {
            DataDecision::Purge => true,
            DataDecision::Keep => false,
            DataDecision::Ask => {
                if system.is_interactive() {
                    let template = receipt
                        .as_ref()
                        .map(|r| r.preserve_prompt.as_str())
                        .unwrap_or(crate::bundle::DEFAULT_PRESERVE_PROMPT);
                    let prompt =
                        template.replace("{dir}", &layout.data_dir.display().to_string());
                    system.confirm(&prompt)?
                } else {
                    info!("no terminal attached; keeping user data (pass --purge-data to delete)");
                    false
                }
            }
        };
        if purge {
            purge_data_dir(layout)
        } else {
            info!(
                "user data kept at {} and will be picked up by a future reinstall",
                layout.data_dir.display()
            );
            DataOutcome::Kept(layout.data_dir.clone())
        }
    };

    Ok(UninstallReport {
        program_removed,
        data,
    })
}

/// Deletes the data directory entry by entry, children before parents,
/// collecting failures instead of aborting on the first one.
fn purge_data_dir(layout: &Layout) -> DataOutcome {
    let mut failures: Vec<(PathBuf, String)> = Vec::new();

    for entry in WalkDir::new(&layout.data_dir)
        .contents_first(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        let result = if entry.file_type().is_dir() {
            fs::remove_dir(path)
        } else {
            fs::remove_file(path)
        };
        match result {
            Ok(()) => {}
            Err(err) => {
                warn!("could not delete {}: {}", path.display(), err);
                failures.push((path.to_path_buf(), err.to_string()));
            }
        }
    }

    if failures.is_empty() {
        info!("deleted user data at {}", layout.data_dir.display());
        DataOutcome::Purged
    } else {
        warn!(
            "{} entries under {} could not be deleted; remove them manually",
            failures.len(),
            layout.data_dir.display()
        );
        DataOutcome::PartiallyPurged { failures }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{self, BundleManifest, SizeRange};
    use crate::install::{self, InstallOptions};
    use crate::package;
    use crate::state::Tasks;
    use crate::system::MockSystem;
    use std::path::Path;

    fn installed_machine(root: &Path) -> (Layout, MockSystem) {
        let src = root.join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("DeskPulse.exe"), "launcher").unwrap();
        let manifest = BundleManifest {
            product: "DeskPulse".to_string(),
            version: "1.0.0".to_string(),
            entry_point: "DeskPulse.exe".to_string(),
            include: vec![],
            exclude: vec![],
            expected: SizeRange {
                min_bytes: 1,
                max_bytes: 1_000_000,
                min_files: 1,
            },
            default_tasks: Tasks::default(),
            preserve_prompt: None,
        };
        let bundle_dir = root.join("bundle");
        bundle::build(&src, &manifest, &bundle_dir).unwrap();
        let pkg = root.join("setup.tar.gz");
        package::compile(&bundle_dir, &pkg, package::DEFAULT_MAX_ARTIFACT_BYTES).unwrap();

        let layout = Layout {
            program_dir: root.join("programs").join("DeskPulse"),
            data_dir: root.join("appdata").join("DeskPulse"),
        };
        let mock = MockSystem::default();
        install::install(&layout, &mock, &pkg, &InstallOptions::default()).unwrap();
        (layout, mock)
    }

    fn seed_user_data(layout: &Layout) {
        fs::create_dir_all(layout.logs_dir()).unwrap();
        fs::write(layout.config_path(), r#"{"backend_url":"http://x:1"}"#).unwrap();
        fs::write(layout.database_path(), "events").unwrap();
        fs::write(layout.logs_dir().join("app.log"), "lines").unwrap();
    }

    #[test]
    fn keep_leaves_data_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let (layout, mock) = installed_machine(tmp.path());
        seed_user_data(&layout);
        let config_before = fs::read_to_string(layout.config_path()).unwrap();

        let report = uninstall(&layout, &mock, DataDecision::Keep, &UninstallOptions::default()).unwrap();

        assert!(report.program_removed);
        assert!(!layout.program_dir.exists());
        assert_eq!(report.data, DataOutcome::Kept(layout.data_dir.clone()));
        assert_eq!(fs::read_to_string(layout.config_path()).unwrap(), config_before);
        // Shortcuts are gone regardless of the data decision.
        assert!(mock.shortcuts.lock().unwrap().is_empty());
    }

    #[test]
    fn purge_removes_data_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let (layout, mock) = installed_machine(tmp.path());
        seed_user_data(&layout);

        let report = uninstall(&layout, &mock, DataDecision::Purge, &UninstallOptions::default()).unwrap();

        assert_eq!(report.data, DataOutcome::Purged);
        assert!(!layout.data_dir.exists());
        assert!(!layout.program_dir.exists());
    }

    #[test]
    fn interactive_no_keeps_data() {
        let tmp = tempfile::tempdir().unwrap();
        let (layout, _) = installed_machine(tmp.path());
        seed_user_data(&layout);
        let mock = MockSystem::interactive(false);

        let report = uninstall(&layout, &mock, DataDecision::Ask, &UninstallOptions::default()).unwrap();

        assert!(matches!(report.data, DataOutcome::Kept(_)));
        assert!(layout.config_path().exists());
        // The prompt named the exact directory to be deleted.
        let prompts = mock.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains(&layout.data_dir.display().to_string()));
    }

    #[test]
    fn interactive_yes_purges_data() {
        let tmp = tempfile::tempdir().unwrap();
        let (layout, _) = installed_machine(tmp.path());
        seed_user_data(&layout);
        let mock = MockSystem::interactive(true);

        let report = uninstall(&layout, &mock, DataDecision::Ask, &UninstallOptions::default()).unwrap();
        assert_eq!(report.data, DataOutcome::Purged);
        assert!(!layout.data_dir.exists());
    }

    #[test]
    fn non_interactive_ask_defaults_to_keep() {
        let tmp = tempfile::tempdir().unwrap();
        let (layout, _) = installed_machine(tmp.path());
        seed_user_data(&layout);
        let mock = MockSystem::default(); // interactive = false

        let report = uninstall(&layout, &mock, DataDecision::Ask, &UninstallOptions::default()).unwrap();
        assert!(matches!(report.data, DataOutcome::Kept(_)));
        assert!(mock.prompts.lock().unwrap().is_empty());
    }

    #[test]
    fn uninstall_without_data_dir_reports_not_present() {
        let tmp = tempfile::tempdir().unwrap();
        let (layout, mock) = installed_machine(tmp.path());

        let report = uninstall(&layout, &mock, DataDecision::Ask, &UninstallOptions::default()).unwrap();
        assert_eq!(report.data, DataOutcome::NotPresent);
    }

    #[test]
    fn uninstall_on_clean_machine_is_a_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = Layout {
            program_dir: tmp.path().join("programs").join("DeskPulse"),
            data_dir: tmp.path().join("appdata").join("DeskPulse"),
        };
        let mock = MockSystem::default();

        let report = uninstall(&layout, &mock, DataDecision::Ask, &UninstallOptions::default()).unwrap();
        assert!(!report.program_removed);
        assert_eq!(report.data, DataOutcome::NotPresent);
    }

    #[test]
    fn skip_tasks_leaves_shortcuts_and_autostart_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let (layout, mock) = installed_machine(tmp.path());
        mock.register_autostart("DeskPulse", Path::new("/x/DeskPulse.exe"))
            .unwrap();
        assert_eq!(mock.shortcuts.lock().unwrap().len(), 2);

        let opts = UninstallOptions { skip_tasks: true };
        let report = uninstall(&layout, &mock, DataDecision::Keep, &opts).unwrap();

        assert!(report.program_removed);
        assert!(!layout.program_dir.exists());
        // The host surfaces were never touched.
        assert_eq!(mock.shortcuts.lock().unwrap().len(), 2);
        assert!(mock.autostart.lock().unwrap().contains_key("DeskPulse"));
    }

    #[test]
    fn dotdot_program_dir_cannot_reach_kept_user_data() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root");
        let data_dir = root.join("data");
        fs::create_dir_all(&data_dir).unwrap();
        fs::write(data_dir.join("config.json"), r#"{"backend_url":"http://x:1"}"#).unwrap();

        // Lexically this is a sibling of `data`, but it resolves to `root`
        // itself, so removing it would take the user data along.
        let layout = Layout {
            program_dir: root.join("sub").join(".."),
            data_dir: data_dir.clone(),
        };
        let mock = MockSystem::default();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            uninstall(&layout, &mock, DataDecision::Keep, &UninstallOptions::default())
        }));
        // Debug builds panic on the violated invariant; release builds error.
        match result {
            Ok(inner) => assert!(inner.is_err()),
            Err(_) => {}
        }
        assert!(data_dir.join("config.json").exists());
    }

    #[test]
    fn purge_path_checks_disjointness_first() {
        let tmp = tempfile::tempdir().unwrap();
        let (layout, mock) = installed_machine(tmp.path());
        seed_user_data(&layout);

        uninstall(&layout, &mock, DataDecision::Purge, &UninstallOptions::default()).unwrap();
        crate::invariant_ppt::contract_test(
            "uninstall",
            &["program directory and user-data directory must be disjoint"],
        );
    }

    #[cfg(unix)]
    #[test]
    fn partial_purge_reports_failures_and_continues() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let (layout, mock) = installed_machine(tmp.path());
        seed_user_data(&layout);

        // Make the logs directory undeletable by dropping write permission.
        let locked = layout.logs_dir();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o555)).unwrap();

        // Root ignores permission bits; the scenario can't be staged there.
        if fs::write(locked.join("probe"), "x").is_ok() {
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let report = uninstall(&layout, &mock, DataDecision::Purge, &UninstallOptions::default()).unwrap();

        match report.data {
            DataOutcome::PartiallyPurged { ref failures } => {
                assert!(!failures.is_empty());
                assert!(failures.iter().any(|(p, _)| p.starts_with(&locked)));
            }
            other => panic!("expected partial purge, got {other:?}"),
        }
        // Deletable entries are still gone.
        assert!(!layout.database_path().exists());

        // Cleanup so the tempdir can be dropped.
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
    }
}
