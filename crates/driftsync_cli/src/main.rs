//! Driftsync CLI
//!
//! Command-line tools for inspecting and maintaining a local store.
//!
//! # Commands
//!
//! - `status` - Display store statistics and device cursors
//! - `outbox` - List pending operations awaiting sync
//! - `gc` - Purge tombstones past retention
//! - `device` - Show this store's device identity
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Driftsync command-line store tools.
#[derive(Parser)]
#[command(name = "driftsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display store statistics and device cursors
    Status {
        /// Restrict output to one workspace
        #[arg(short, long)]
        workspace: Option<String>,
    },

    /// List pending operations awaiting sync
    Outbox {
        /// Show only operations marked failed
        #[arg(short, long)]
        failed: bool,
    },

    /// Purge tombstones past retention
    Gc {
        /// Workspace to collect
        #[arg(short, long)]
        workspace: String,

        /// Retention window in days
        #[arg(short, long, default_value = "14")]
        retention_days: u64,

        /// Dry run - show what would be purged
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Show this store's device identity
    Device,

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Status { workspace } => {
            let path = cli.path.ok_or("Store path required for status")?;
            commands::status::run(&path, workspace.as_deref())?;
        }
        Commands::Outbox { failed } => {
            let path = cli.path.ok_or("Store path required for outbox")?;
            commands::outbox::run(&path, failed)?;
        }
        Commands::Gc {
            workspace,
            retention_days,
            dry_run,
        } => {
            let path = cli.path.ok_or("Store path required for gc")?;
            commands::gc::run(&path, &workspace, retention_days, dry_run)?;
        }
        Commands::Device => {
            let path = cli.path.ok_or("Store path required for device")?;
            commands::device::run(&path)?;
        }
        Commands::Version => {
            println!("Driftsync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
