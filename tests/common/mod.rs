//! Shared fixtures for the CLI integration tests: a fake application source
//! tree, a bundle manifest, and helpers that run the real binary end to end.

// Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Output;

use assert_cmd::Command;

pub fn cmd() -> Command {
    Command::cargo_bin("deskpulse-setup").expect("binary builds")
}

/// Lays out a fake DeskPulse application tree: a launcher, a native vision
/// module, and some junk the bundle must exclude.
pub fn write_fake_app(dir: &Path, version: &str) {
    fs::create_dir_all(dir.join("cv").join("__pycache__")).unwrap();
    fs::create_dir_all(dir.join("assets")).unwrap();
    fs::write(dir.join("DeskPulse.exe"), format!("launcher {version}")).unwrap();
    fs::write(
        dir.join("cv").join("pipeline.bin"),
        format!("pose estimation natives {version}"),
    )
    .unwrap();
    fs::write(dir.join("cv").join("__pycache__").join("junk.pyc"), "junk").unwrap();
    fs::write(dir.join("assets").join("icon.ico"), "icon bytes").unwrap();
}

pub fn write_manifest(path: &Path, version: &str) {
    let manifest = serde_json::json!({
        "product": "DeskPulse",
        "version": version,
        "entry_point": "DeskPulse.exe",
        "include": ["assets/icon.ico"],
        "exclude": ["__pycache__"],
        "expected": { "min_bytes": 10, "max_bytes": 100_000_000u64, "min_files": 2 }
    });
    fs::write(path, serde_json::to_string_pretty(&manifest).unwrap()).unwrap();
}

/// Runs bundle + compile for a fake app and returns the installer path.
pub fn build_installer(root: &Path, version: &str) -> PathBuf {
    let src = root.join(format!("app-{version}"));
    write_fake_app(&src, version);
    let manifest = root.join(format!("manifest-{version}.json"));
    write_manifest(&manifest, version);
    let bundle = root.join(format!("bundle-{version}"));
    let pkg = root.join(format!("DeskPulse-{version}-setup.tar.gz"));

    cmd()
        .args(["bundle", "--source"])
        .arg(&src)
        .arg("--manifest")
        .arg(&manifest)
        .arg("--out")
        .arg(&bundle)
        .assert()
        .success();
    cmd()
        .args(["compile", "--bundle"])
        .arg(&bundle)
        .arg("--out")
        .arg(&pkg)
        .assert()
        .success();
    pkg
}

/// Installs a package into test-controlled program/data directories with all
/// system-touching tasks disabled.
pub fn install(pkg: &Path, program_dir: &Path, data_dir: &Path) {
    cmd()
        .arg("install")
        .arg(pkg)
        .arg("--program-dir")
        .arg(program_dir)
        .arg("--data-dir")
        .arg(data_dir)
        .args(["--no-start-menu", "--no-desktop-shortcut"])
        .assert()
        .success();
}

/// stdout + stderr of a finished process, for assertions that don't care
/// which stream a message landed on.
pub fn combined(output: &Output) -> String {
    format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}
