//! # Install / Upgrade
//!
//! Applies an installer package to the machine, driving the
//! `NotInstalled -> Installed` and `Installed -> Installed` (upgrade)
//! transitions.
//!
//! The program directory is replaced wholesale on every install: the package
//! is extracted into a staging directory next to it, verified against the
//! embedded content hashes, and swapped into place with a rename pair. If
//! anything fails before the swap completes, the previous installation is
//! restored. The user-data directory is never read, written, or deleted here;
//! that is the invariant the whole tool exists to uphold.
//!
//! Same-version reinstalls are allowed and idempotent. Downgrades are refused
//! because the app's database schema only migrates forward.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use log::{info, warn};

use crate::config;
use crate::layout::Layout;
use crate::package;
use crate::state::{self, InstallState, Receipt, Tasks, VersionRelation};
use crate::system::{ShortcutLocation, SystemOps};

/// Per-invocation overrides of the task defaults embedded in the package.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskOverrides {
    pub start_menu_shortcut: Option<bool>,
    pub desktop_shortcut: Option<bool>,
    pub autostart: Option<bool>,
}

impl TaskOverrides {
    fn apply(self, defaults: Tasks) -> Tasks {
        Tasks {
            start_menu_shortcut: self.start_menu_shortcut.unwrap_or(defaults.start_menu_shortcut),
            desktop_shortcut: self.desktop_shortcut.unwrap_or(defaults.desktop_shortcut),
            autostart: self.autostart.unwrap_or(defaults.autostart),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InstallOptions {
    pub overrides: TaskOverrides,
    /// Write the default `config.json` if none exists. Off by default: the
    /// app seeds its own config on first run.
    pub seed_config: bool,
}

/// Installs (or upgrades to) the package at `package_path`.
pub fn install(
    layout: &Layout,
    system: &impl SystemOps,
    package_path: &Path,
    opts: &InstallOptions,
) -> Result<Receipt> {
    layout.assert_disjoint()?;

    let metadata = package::read_metadata(package_path)?;

    let existing = match state::detect(layout)? {
        InstallState::NotInstalled => {
            info!("installing {} {}", metadata.product, metadata.version);
            None
        }
        InstallState::Installed(existing) => {
            match state::compare_versions(&existing.version, &metadata.version) {
                VersionRelation::Same => {
                    info!("reinstalling {} {}", metadata.product, metadata.version);
                }
                VersionRelation::Upgrade => {
                    info!(
                        "upgrading {} {} -> {} (user data untouched)",
                        metadata.product, existing.version, metadata.version
                    );
                }
                VersionRelation::Downgrade => {
                    bail!(
                        "installed version {} is newer than package version {}; downgrades are not supported",
                        existing.version,
                        metadata.version
                    );
                }
                VersionRelation::Unknown => {
                    warn!(
                        "cannot compare installed version {:?} with package version {:?}, proceeding as upgrade",
                        existing.version, metadata.version
                    );
                }
            }
            Some(existing)
        }
    };
    // Whether a previous install registered auto-start; an upgrade that turns
    // the task off must clear that registration.
    let previous_autostart = existing.as_ref().map(|r| r.tasks.autostart).unwrap_or(false);

    let tasks = opts.overrides.apply(metadata.default_tasks);

    // Stage next to the program directory so the final swap is a rename on
    // the same filesystem.
    let staging = staging_dir(&layout.program_dir)?;
    let staged = (|| -> Result<Receipt> {
        package::extract(package_path, &staging)?;
        verify_staged(&staging, &metadata.files)?;
        let receipt = Receipt {
            product: metadata.product.clone(),
            version: metadata.version.clone(),
            installed_at: chrono::Utc::now().to_rfc3339(),
            entry_point: metadata.entry_point.clone(),
            tasks,
            preserve_prompt: metadata.preserve_prompt.clone(),
            files: metadata.files.clone(),
        };
        state::write_receipt(&staging.join(crate::layout::RECEIPT_FILE), &receipt)?;
        Ok(receipt)
    })();
    let receipt = match staged {
        Ok(receipt) => receipt,
        Err(err) => {
            let _ = fs::remove_dir_all(&staging);
            return Err(err);
        }
    };

    swap_into_place(&staging, &layout.program_dir)?;

    // Shortcuts and auto-start are best-effort: the program directory is
    // already consistent, so a failure here must not fail the install.
    let launch_target = layout.program_dir.join(&metadata.entry_point);
    apply_tasks(system, &metadata.product, &launch_target, tasks, previous_autostart);

    if opts.seed_config {
        match config::ensure_default(&layout.config_path()) {
            Ok(true) => info!("seeded default config at {}", layout.config_path().display()),
            Ok(false) => info!("config already present, left untouched"),
            Err(err) => warn!("could not seed default config: {err:#}"),
        }
    }

    info!(
        "{} {} installed to {}",
        receipt.product,
        receipt.version,
        layout.program_dir.display()
    );
    Ok(receipt)
}

fn apply_tasks(
    system: &impl SystemOps,
    product: &str,
    launch_target: &Path,
    tasks: Tasks,
    previous_autostart: bool,
) {
    if tasks.start_menu_shortcut {
        if let Err(err) =
            system.create_shortcut(ShortcutLocation::StartMenu, product, launch_target)
        {
            warn!("could not create start menu shortcut: {err:#}");
        }
    }
    if tasks.desktop_shortcut {
        if let Err(err) = system.create_shortcut(ShortcutLocation::Desktop, product, launch_target)
        {
            warn!("could not create desktop shortcut: {err:#}");
        }
    }
    if tasks.autostart {
        if let Err(err) = system.register_autostart(product, launch_target) {
            warn!("could not register auto-start: {err:#}");
        }
    } else if previous_autostart {
        // This upgrade turns a previously-selected auto-start off. A fresh
        // install with the task off leaves the host alone.
        if let Err(err) = system.unregister_autostart(product) {
            warn!("could not clear auto-start registration: {err:#}");
        }
    }
}

/// Every staged file must exist with the exact content hash the package
/// metadata promises. A mismatch means a corrupt or tampered download, which
/// is fatal before anything on the machine has been touched.
fn verify_staged(staging: &Path, files: &[state::FileEntry]) -> Result<()> {
    for file in files {
        let path = staging.join(&file.rel);
        if !path.is_file() {
            bail!("package is corrupt: missing {}", file.rel);
        }
        let actual = state::sha256_file(&path)?;
        if actual != file.sha256 {
            bail!(
                "package is corrupt: {} hash mismatch (expected {}, got {})",
                file.rel,
                file.sha256,
                actual
            );
        }
    }
    Ok(())
}

fn staging_dir(program_dir: &Path) -> Result<PathBuf> {
    let parent = program_dir
        .parent()
        .context("program directory has no parent")?;
    fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    let name = program_dir
        .file_name()
        .context("program directory has no name")?
        .to_string_lossy();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    Ok(parent.join(format!(".{name}.staging-{nonce}")))
}

/// Replaces `program_dir` with `staging` via rename, restoring the previous
/// tree if the swap fails halfway.
fn swap_into_place(staging: &Path, program_dir: &Path) -> Result<()> {
    let backup = if program_dir.exists() {
        let nonce = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let backup = program_dir.with_file_name(format!(
            ".{}.backup-{nonce}",
            program_dir.file_name().unwrap_or_default().to_string_lossy()
        ));
        fs::rename(program_dir, &backup).with_context(|| {
            format!("move aside {} -> {}", program_dir.display(), backup.display())
        })?;
        Some(backup)
    } else {
        None
    };

    if let Err(err) = fs::rename(staging, program_dir) {
        if let Some(backup) = &backup {
            let _ = fs::rename(backup, program_dir);
        }
        let _ = fs::remove_dir_all(staging);
        return Err(err).with_context(|| {
            format!("install {} -> {}", staging.display(), program_dir.display())
        });
    }

    if let Some(backup) = backup {
        if let Err(err) = fs::remove_dir_all(&backup) {
            warn!(
                "previous version left at {} (could not remove: {err:#})",
                backup.display()
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{self, BundleManifest, SizeRange};
    use crate::state::hash_tree;
    use crate::system::MockSystem;

    fn make_package(root: &Path, version: &str, payload: &str) -> PathBuf {
        let src = root.join(format!("src-{version}"));
        fs::create_dir_all(src.join("cv")).unwrap();
        fs::write(src.join("DeskPulse.exe"), format!("launcher {version}")).unwrap();
        fs::write(src.join("cv").join("pipeline.bin"), payload).unwrap();

        let manifest = BundleManifest {
            product: "DeskPulse".to_string(),
            version: version.to_string(),
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
        let bundle_dir = root.join(format!("bundle-{version}"));
        bundle::build(&src, &manifest, &bundle_dir).unwrap();
        let pkg = root.join(format!("setup-{version}.tar.gz"));
        package::compile(&bundle_dir, &pkg, package::DEFAULT_MAX_ARTIFACT_BYTES).unwrap();
        pkg
    }

    fn test_layout(root: &Path) -> Layout {
        Layout {
            program_dir: root.join("programs").join("DeskPulse"),
            data_dir: root.join("appdata").join("DeskPulse"),
        }
    }

    #[test]
    fn fresh_install_writes_receipt_and_shortcuts() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = test_layout(tmp.path());
        let pkg = make_package(tmp.path(), "1.0.0", "native v1");
        let mock = MockSystem::default();

        let receipt = install(&layout, &mock, &pkg, &InstallOptions::default()).unwrap();

        assert!(layout.program_dir.join("DeskPulse.exe").exists());
        assert!(layout.receipt_path().exists());
        assert_eq!(receipt.version, "1.0.0");
        // Default tasks: start menu + desktop, no auto-start.
        assert_eq!(mock.shortcuts.lock().unwrap().len(), 2);
        assert!(mock.autostart.lock().unwrap().is_empty());
        // Install never creates the data directory.
        assert!(!layout.data_dir.exists());
    }

    #[test]
    fn task_overrides_win_over_package_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = test_layout(tmp.path());
        let pkg = make_package(tmp.path(), "1.0.0", "native v1");
        let mock = MockSystem::default();

        let opts = InstallOptions {
            overrides: TaskOverrides {
                desktop_shortcut: Some(false),
                autostart: Some(true),
                ..Default::default()
            },
            seed_config: false,
        };
        install(&layout, &mock, &pkg, &opts).unwrap();

        let shortcuts = mock.shortcuts.lock().unwrap();
        assert_eq!(shortcuts.len(), 1);
        assert_eq!(shortcuts[0].0, ShortcutLocation::StartMenu);
        assert!(mock.autostart.lock().unwrap().contains_key("DeskPulse"));
    }

    #[test]
    fn fresh_install_with_autostart_off_leaves_the_host_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = test_layout(tmp.path());
        let pkg = make_package(tmp.path(), "1.0.0", "native v1");
        let mock = MockSystem::default();

        install(&layout, &mock, &pkg, &InstallOptions::default()).unwrap();

        // Nothing to clear, so no clearing call is made.
        assert_eq!(*mock.autostart_unregisters.lock().unwrap(), 0);
    }

    #[test]
    fn upgrade_clears_previously_selected_autostart() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = test_layout(tmp.path());
        let mock = MockSystem::default();

        let v1 = make_package(tmp.path(), "1.0.0", "native v1");
        let opts = InstallOptions {
            overrides: TaskOverrides {
                autostart: Some(true),
                ..Default::default()
            },
            seed_config: false,
        };
        install(&layout, &mock, &v1, &opts).unwrap();
        assert!(mock.autostart.lock().unwrap().contains_key("DeskPulse"));

        // Upgrading with the task back at its default (off) clears it.
        let v2 = make_package(tmp.path(), "1.1.0", "native v2");
        install(&layout, &mock, &v2, &InstallOptions::default()).unwrap();
        assert!(mock.autostart.lock().unwrap().is_empty());
    }

    #[test]
    fn upgrade_replaces_program_and_preserves_user_data() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = test_layout(tmp.path());
        let mock = MockSystem::default();

        let v1 = make_package(tmp.path(), "1.0.0", "native v1");
        install(&layout, &mock, &v1, &InstallOptions::default()).unwrap();

        // Simulate the app having run: config, database, logs.
        fs::create_dir_all(layout.logs_dir()).unwrap();
        fs::write(layout.config_path(), r#"{"backend_url":"http://my-box:9000"}"#).unwrap();
        fs::write(layout.database_path(), "posture events").unwrap();
        fs::write(layout.logs_dir().join("app.log"), "log lines").unwrap();
        let data_before = hash_tree(&layout.data_dir).unwrap();

        let v2 = make_package(tmp.path(), "1.1.0", "native v2 bigger");
        install(&layout, &mock, &v2, &InstallOptions::default()).unwrap();

        let receipt = state::read_receipt(&layout.receipt_path()).unwrap();
        assert_eq!(receipt.version, "1.1.0");
        assert_eq!(
            fs::read_to_string(layout.program_dir.join("cv").join("pipeline.bin")).unwrap(),
            "native v2 bigger"
        );
        // The upgrade contract: user data is bit-for-bit untouched.
        assert_eq!(hash_tree(&layout.data_dir).unwrap(), data_before);
    }

    #[test]
    fn reinstall_same_version_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = test_layout(tmp.path());
        let mock = MockSystem::default();
        let pkg = make_package(tmp.path(), "1.0.0", "native v1");

        install(&layout, &mock, &pkg, &InstallOptions::default()).unwrap();
        let receipt_a = state::read_receipt(&layout.receipt_path()).unwrap();

        install(&layout, &mock, &pkg, &InstallOptions::default()).unwrap();
        let receipt_b = state::read_receipt(&layout.receipt_path()).unwrap();

        // Identical payload; only the install timestamp may differ.
        assert_eq!(receipt_a.files, receipt_b.files);
        assert_eq!(receipt_a.version, receipt_b.version);
        // No duplicate shortcuts accumulate.
        assert_eq!(mock.shortcuts.lock().unwrap().len(), 2);
    }

    #[test]
    fn downgrade_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = test_layout(tmp.path());
        let mock = MockSystem::default();

        let v2 = make_package(tmp.path(), "2.0.0", "native v2");
        install(&layout, &mock, &v2, &InstallOptions::default()).unwrap();

        let v1 = make_package(tmp.path(), "1.0.0", "native v1");
        let err = install(&layout, &mock, &v1, &InstallOptions::default()).unwrap_err();
        assert!(err.to_string().contains("downgrades are not supported"));
        // Existing install is untouched.
        let receipt = state::read_receipt(&layout.receipt_path()).unwrap();
        assert_eq!(receipt.version, "2.0.0");
    }

    #[test]
    fn corrupt_package_leaves_existing_install_intact() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = test_layout(tmp.path());
        let mock = MockSystem::default();

        let v1 = make_package(tmp.path(), "1.0.0", "native v1");
        install(&layout, &mock, &v1, &InstallOptions::default()).unwrap();

        // Build a v2 bundle, then silently corrupt a payload file after
        // indexing so the embedded hashes no longer match.
        let src = tmp.path().join("src-corrupt");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("DeskPulse.exe"), "launcher 2.0.0").unwrap();
        let manifest = BundleManifest {
            product: "DeskPulse".to_string(),
            version: "2.0.0".to_string(),
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
        let bundle_dir = tmp.path().join("bundle-corrupt");
        bundle::build(&src, &manifest, &bundle_dir).unwrap();
        fs::write(bundle_dir.join("DeskPulse.exe"), "tampered").unwrap();
        let pkg = tmp.path().join("corrupt.tar.gz");
        package::compile(&bundle_dir, &pkg, package::DEFAULT_MAX_ARTIFACT_BYTES).unwrap();

        let err = install(&layout, &mock, &pkg, &InstallOptions::default()).unwrap_err();
        assert!(err.to_string().contains("hash mismatch"));

        let receipt = state::read_receipt(&layout.receipt_path()).unwrap();
        assert_eq!(receipt.version, "1.0.0");
        assert_eq!(
            fs::read_to_string(layout.program_dir.join("DeskPulse.exe")).unwrap(),
            "launcher 1.0.0"
        );
    }

    #[test]
    fn seed_config_only_writes_when_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = test_layout(tmp.path());
        let mock = MockSystem::default();
        let pkg = make_package(tmp.path(), "1.0.0", "native v1");

        let opts = InstallOptions {
            seed_config: true,
            ..Default::default()
        };
        install(&layout, &mock, &pkg, &opts).unwrap();
        let seeded = fs::read_to_string(layout.config_path()).unwrap();
        assert!(seeded.contains(config::DEFAULT_BACKEND_URL));

        // User edits, then reinstalls with --seed-config again.
        fs::write(layout.config_path(), r#"{"backend_url":"http://mine:1"}"#).unwrap();
        install(&layout, &mock, &pkg, &opts).unwrap();
        assert_eq!(
            fs::read_to_string(layout.config_path()).unwrap(),
            r#"{"backend_url":"http://mine:1"}"#
        );
    }

    #[test]
    fn overlapping_layout_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = Layout {
            program_dir: tmp.path().join("DeskPulse"),
            data_dir: tmp.path().join("DeskPulse").join("data"),
        };
        let pkg = make_package(tmp.path(), "1.0.0", "native v1");
        let mock = MockSystem::default();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            install(&layout, &mock, &pkg, &InstallOptions::default())
        }));
        // Debug builds panic on the violated invariant; release builds error.
        match result {
            Ok(inner) => assert!(inner.is_err()),
            Err(_) => {}
        }
    }
}
