//! # Doctor
//!
//! Read-only health report for a machine: which lifecycle state it is in,
//! whether the installed files still match their receipt hashes, whether the
//! layout invariant holds, and what shape the user data is in. Replaces the
//! manual post-install checklist a release engineer would otherwise walk
//! through by hand.

use anyhow::Result;
use walkdir::WalkDir;

use crate::config;
use crate::layout::{Layout, trees_disjoint};
use crate::state::{self, InstallState, sha256_file};

/// Runs the report. Never modifies the system.
pub fn doctor(layout: &Layout) -> Result<()> {
    println!();
    println!("═══════════════════════════════════════════════════════════════");
    println!("                   DeskPulse Install Health");
    println!("═══════════════════════════════════════════════════════════════");
    println!();

    let mut problems = 0usize;

    // 1. Lifecycle state
    println!("1. INSTALL STATE");
    let receipt = match state::detect(layout) {
        Ok(InstallState::NotInstalled) => {
            if layout.program_dir.exists() {
                println!(
                    "   ⚠ Program directory exists but has no receipt: {}",
                    layout.program_dir.display()
                );
                println!("     (a broken or foreign install - reinstalling will replace it)");
                problems += 1;
            } else {
                println!("   Not installed.");
            }
            None
        }
        Ok(InstallState::Installed(receipt)) => {
            println!(
                "   ✓ Installed: {} {} (installed {})",
                receipt.product, receipt.version, receipt.installed_at
            );
            println!("     Program dir: {}", layout.program_dir.display());
            Some(receipt)
        }
        Err(err) => {
            println!("   ⚠ Receipt unreadable: {err:#}");
            problems += 1;
            None
        }
    };

    // 2. Program integrity against the receipt
    if let Some(receipt) = &receipt {
        let mut missing = Vec::new();
        let mut modified = Vec::new();
        for file in &receipt.files {
            let path = layout.program_dir.join(&file.rel);
            if !path.is_file() {
                missing.push(file.rel.clone());
            } else if sha256_file(&path).map(|h| h != file.sha256).unwrap_or(true) {
                modified.push(file.rel.clone());
            }
        }
        println!();
        println!("2. PROGRAM FILES ({} in receipt)", receipt.files.len());
        if missing.is_empty() && modified.is_empty() {
            println!("   ✓ All files present with matching content hashes");
        } else {
            problems += 1;
            if !missing.is_empty() {
                println!("   ⚠ {} missing:", missing.len());
                for rel in missing.iter().take(3) {
                    println!("     - {rel}");
                }
                if missing.len() > 3 {
                    println!("     ... and {} more", missing.len() - 3);
                }
            }
            if !modified.is_empty() {
                println!("   ⚠ {} modified since install:", modified.len());
                for rel in modified.iter().take(3) {
                    println!("     - {rel}");
                }
                if modified.len() > 3 {
                    println!("     ... and {} more", modified.len() - 3);
                }
            }
            println!("     Run 'deskpulse-setup install' again to repair.");
        }
    }

    // 3. Layout invariant
    println!();
    println!("3. DIRECTORY LAYOUT");
    println!("   Program: {}", layout.program_dir.display());
    println!("   Data:    {}", layout.data_dir.display());
    if trees_disjoint(&layout.program_dir, &layout.data_dir) {
        println!("   ✓ Trees are disjoint (upgrades can never touch your data)");
    } else {
        println!("   ⚠ Trees OVERLAP - uninstalling would delete user data!");
        problems += 1;
    }

    // 4. User data
    println!();
    println!("4. USER DATA");
    if !layout.data_dir.exists() {
        println!("   None yet (created by the app on first run).");
    } else {
        let config_path = layout.config_path();
        if config_path.exists() {
            match config::load(&config_path) {
                Ok(config) => {
                    println!("   ✓ config.json valid (backend: {})", config.backend_url)
                }
                Err(err) => {
                    println!("   ⚠ config.json problem: {err:#}");
                    problems += 1;
                }
            }
        } else {
            println!("   config.json absent (app will create it with defaults).");
        }

        let db = layout.database_path();
        if db.exists() {
            let size = std::fs::metadata(&db).map(|m| m.len()).unwrap_or(0);
            println!("   ✓ posture database present ({size} bytes)");
        } else {
            println!("   posture database absent.");
        }

        let logs = layout.logs_dir();
        if logs.exists() {
            let count = WalkDir::new(&logs)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .count();
            println!("   {count} log file(s) under {}", logs.display());
        }
    }

    // 5. Summary
    println!();
    println!("───────────────────────────────────────────────────────────────");
    println!();
    if problems == 0 {
        println!("✓ Everything checks out.");
    } else {
        println!("{problems} problem(s) found - see above.");
    }
    println!();

    Ok(())
}
