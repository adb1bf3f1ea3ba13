//! Snoop: snapshot capture for tournament events.
//!
//! # Usage
//!
//! ```text
//! snoop [--backup-dir <dir>] run [--mirror-dir <dir>] [--retry-initial-ms N] [--retry-max-ms N]
//! snoop list [--json]
//! snoop add <event-id> [--name <name>]
//! snoop remove <name>
//! snoop snapshot <name> <label>
//! snoop stop
//! snoop status
//! ```

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    run::RunArgs,
    snapshot::SnapshotArgs,
    watch::{AddArgs, ListArgs, RemoveArgs},
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "snoop",
    version,
    about = "Capture rolling and per-round snapshots of tournament events",
    long_about = None,
)]
struct Cli {
    /// Backup root holding the watch list and every watcher's snapshots.
    #[arg(
        long,
        global = true,
        env = "SNOOP_BACKUP_DIR",
        default_value = "snapshots",
        value_name = "DIR"
    )]
    backup_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the snoop daemon in the foreground.
    Run(RunArgs),

    /// List watched events.
    List(ListArgs),

    /// Start watching an event.
    Add(AddArgs),

    /// Stop watching an event. Snapshots already on disk are kept.
    Remove(RemoveArgs),

    /// Take a labelled archival snapshot through the running daemon.
    Snapshot(SnapshotArgs),

    /// Ask the running daemon to stop every watcher and exit.
    Stop,

    /// Print daemon status as JSON.
    Status,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    let root = cli.backup_dir;
    match cli.command {
        Commands::Run(args) => args.run(&root),
        Commands::List(args) => args.run(&root),
        Commands::Add(args) => args.run(&root),
        Commands::Remove(args) => args.run(&root),
        Commands::Snapshot(args) => args.run(&root),
        Commands::Stop => commands::daemon::stop(&root),
        Commands::Status => commands::daemon::status(&root),
    }
}
