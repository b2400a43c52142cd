//! # DeskPulse Setup: The Main Entry Point
//!
//! This module handles Command Line Interface (CLI) parsing, logging
//! initialization, and dispatching commands to the appropriate sub-modules.
//! It is the orchestrator of the DeskPulse packaging and installation
//! lifecycle tool.
//!
//! The lifecycle is four stages, each a single run-to-completion command:
//! `bundle` and `compile` on the build machine, `install` and `uninstall`
//! on the target machine. `doctor` inspects a target machine without
//! changing it.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::{LevelFilter, error};
use simplelog::{Config, SimpleLogger};

mod bundle;
mod config;
mod doctor;
mod install;
mod invariant_ppt;
mod layout;
mod package;
mod state;
mod system;
mod uninstall;

use layout::Layout;
use system::HostSystem;

/// The primary Command Line Interface (CLI) configuration.
///
/// Uses `clap` for sub-command parsing and help generation.
#[derive(Parser)]
#[command(name = "deskpulse-setup")]
#[command(about = "Packaging and install lifecycle for DeskPulse. Upgrades never touch user data.", long_about = None)]
struct Cli {
    /// The sub-command to execute (bundle, compile, install, ...).
    #[command(subcommand)]
    command: Option<Commands>,

    /// Turn on verbose logging.
    ///
    /// - `-v`: Debug
    /// - `-vv`: Trace
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Available sub-commands for the DeskPulse setup utility.
#[derive(Subcommand)]
enum Commands {
    /// Build the interpreter-free bundle from the application source tree.
    ///
    /// Driven by a version-controlled manifest (entry point, include
    /// allow-list, exclude deny-list, expected size range). The output is
    /// cleaned first, so rebuilding is always from scratch.
    Bundle {
        /// Application source tree to bundle.
        #[arg(long)]
        source: PathBuf,

        /// Bundle manifest file.
        #[arg(long, default_value = "bundle.manifest.json")]
        manifest: PathBuf,

        /// Output bundle directory.
        #[arg(long, default_value = "dist/bundle")]
        out: PathBuf,
    },
    /// Compile the bundle into a single distributable installer file.
    ///
    /// Requires a finished bundle (run `bundle` first). Embeds the install
    /// metadata - version, entry point, default shortcut tasks, and the
    /// uninstall data-preservation prompt - so the artifact is
    /// self-contained on the target machine.
    Compile {
        /// Bundle directory produced by `bundle`.
        #[arg(long, default_value = "dist/bundle")]
        bundle: PathBuf,

        /// Output installer path. Defaults to
        /// `dist/<Product>-<version>-setup.tar.gz`.
        #[arg(long)]
        out: Option<PathBuf>,

        /// Warn when the artifact exceeds this many megabytes.
        #[arg(long, default_value_t = 400)]
        max_size_mb: u64,
    },
    /// Install or upgrade from an installer package.
    ///
    /// The program directory is replaced atomically; the user-data
    /// directory is never touched. Same-version reinstalls are idempotent,
    /// downgrades are refused.
    Install {
        /// Installer package (`*-setup.tar.gz`).
        package: PathBuf,

        /// Override the program directory (default: per-user Programs dir).
        #[arg(long)]
        program_dir: Option<PathBuf>,

        /// Override the user-data directory (default: per-user AppData dir).
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Skip the start menu shortcut.
        #[arg(long)]
        no_start_menu: bool,

        /// Skip the desktop shortcut (created by default).
        #[arg(long)]
        no_desktop_shortcut: bool,

        /// Start DeskPulse automatically at login (off by default).
        #[arg(long)]
        autostart: bool,

        /// Write a default config.json if none exists yet.
        #[arg(long)]
        seed_config: bool,
    },
    /// Uninstall: program files and shortcuts go unconditionally, user data
    /// only with explicit consent.
    ///
    /// Without a flag, asks interactively; when no terminal is attached the
    /// data is kept. Files that cannot be deleted are reported and left for
    /// manual cleanup - partial deletion never claims success.
    Uninstall {
        /// Override the program directory.
        #[arg(long)]
        program_dir: Option<PathBuf>,

        /// Override the user-data directory.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Delete the user-data directory without asking.
        #[arg(long, conflicts_with = "keep_data")]
        purge_data: bool,

        /// Keep the user-data directory without asking.
        #[arg(long, conflicts_with = "purge_data")]
        keep_data: bool,

        /// Leave shortcuts and auto-start entries untouched.
        #[arg(long)]
        skip_tasks: bool,
    },
    /// Inspect the install state and report issues.
    ///
    /// Checks for:
    /// - Receipt presence and version.
    /// - Program files matching their install-time hashes.
    /// - Disjointness of the program and data trees.
    /// - Validity of the user config.
    Doctor {
        /// Override the program directory.
        #[arg(long)]
        program_dir: Option<PathBuf>,

        /// Override the user-data directory.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    // Determine log level based on verbosity flag
    let log_level = match cli.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    // Initialize logger
    // We ignore the result here as logging failure shouldn't crash the startup
    let _ = SimpleLogger::init(log_level, Config::default());

    let result = match cli.command {
        Some(Commands::Bundle {
            source,
            manifest,
            out,
        }) => run_bundle(&source, &manifest, &out),
        Some(Commands::Compile {
            bundle,
            out,
            max_size_mb,
        }) => run_compile(&bundle, out, max_size_mb),
        Some(Commands::Install {
            package,
            program_dir,
            data_dir,
            no_start_menu,
            no_desktop_shortcut,
            autostart,
            seed_config,
        }) => run_install(
            &package,
            program_dir,
            data_dir,
            no_start_menu,
            no_desktop_shortcut,
            autostart,
            seed_config,
        ),
        Some(Commands::Uninstall {
            program_dir,
            data_dir,
            purge_data,
            keep_data,
            skip_tasks,
        }) => run_uninstall(program_dir, data_dir, purge_data, keep_data, skip_tasks),
        Some(Commands::Doctor {
            program_dir,
            data_dir,
        }) => Layout::resolve(program_dir.as_deref(), data_dir.as_deref())
            .and_then(|layout| doctor::doctor(&layout)),
        None => {
            // Default behavior if no command: print the help message
            use clap::CommandFactory;
            let _ = Cli::command().print_help();
            return;
        }
    };

    if let Err(e) = result {
        error!("{e:#}");
        std::process::exit(1);
    }
}

fn run_bundle(source: &std::path::Path, manifest: &std::path::Path, out: &std::path::Path) -> anyhow::Result<()> {
    let manifest = bundle::load_manifest(manifest)?;
    let report = bundle::build(source, &manifest, out)?;
    println!(
        "Bundle ready: {} files, {} bytes at {}",
        report.file_count,
        report.total_bytes,
        out.display()
    );
    Ok(())
}

fn run_compile(
    bundle_dir: &std::path::Path,
    out: Option<PathBuf>,
    max_size_mb: u64,
) -> anyhow::Result<()> {
    let out = match out {
        Some(out) => out,
        None => {
            let index = bundle::read_index(bundle_dir)?;
            PathBuf::from("dist").join(format!("{}-{}-setup.tar.gz", index.product, index.version))
        }
    };
    let index = package::compile(bundle_dir, &out, max_size_mb * 1024 * 1024)?;
    println!(
        "Installer ready: {} {} at {}",
        index.product,
        index.version,
        out.display()
    );
    Ok(())
}

fn run_install(
    package: &std::path::Path,
    program_dir: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    no_start_menu: bool,
    no_desktop_shortcut: bool,
    autostart: bool,
    seed_config: bool,
) -> anyhow::Result<()> {
    let layout = Layout::resolve(program_dir.as_deref(), data_dir.as_deref())?;
    let opts = install::InstallOptions {
        overrides: install::TaskOverrides {
            start_menu_shortcut: no_start_menu.then_some(false),
            desktop_shortcut: no_desktop_shortcut.then_some(false),
            autostart: autostart.then_some(true),
        },
        seed_config,
    };
    let receipt = install::install(&layout, &HostSystem, package, &opts)?;
    println!(
        "{} {} installed to {}",
        receipt.product,
        receipt.version,
        layout.program_dir.display()
    );
    Ok(())
}

fn run_uninstall(
    program_dir: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    purge_data: bool,
    keep_data: bool,
    skip_tasks: bool,
) -> anyhow::Result<()> {
    let layout = Layout::resolve(program_dir.as_deref(), data_dir.as_deref())?;
    let decision = if purge_data {
        uninstall::DataDecision::Purge
    } else if keep_data {
        uninstall::DataDecision::Keep
    } else {
        uninstall::DataDecision::Ask
    };
    let opts = uninstall::UninstallOptions { skip_tasks };
    let report = uninstall::uninstall(&layout, &HostSystem, decision, &opts)?;

    match report.data {
        uninstall::DataOutcome::NotPresent => {
            println!("Uninstalled. No user data was present.");
        }
        uninstall::DataOutcome::Kept(dir) => {
            println!("Uninstalled. Your data was kept at {}", dir.display());
            println!("A future reinstall will pick it up unchanged.");
        }
        uninstall::DataOutcome::Purged => {
            println!("Uninstalled. User data deleted.");
        }
        uninstall::DataOutcome::PartiallyPurged { failures } => {
            println!(
                "Uninstalled, but {} item(s) could not be deleted:",
                failures.len()
            );
            for (path, cause) in &failures {
                println!("  ✕ {} ({})", path.display(), cause);
            }
            println!("Please delete them manually (a running DeskPulse process may be holding them).");
        }
    }
    Ok(())
}
