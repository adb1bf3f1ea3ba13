//! `snoop snapshot <name> <label>`

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use clap::Args;
use colored::Colorize;

use snoop_core::types::validate_label;
use snoop_daemon::{request_snapshot, DaemonError};

#[derive(Args, Debug)]
pub struct SnapshotArgs {
    /// Watcher name, as shown by `snoop list`.
    pub name: String,

    /// Label embedded in the snapshot file name (e.g. "top8", "finals").
    pub label: String,
}

impl SnapshotArgs {
    pub fn run(self, root: &Path) -> Result<()> {
        validate_label(&self.label)?;
        let data = match request_snapshot(root, &self.name, &self.label) {
            Ok(data) => data,
            Err(DaemonError::DaemonNotRunning { .. }) => {
                return Err(anyhow!(
                    "snoop daemon is not running; start it with `snoop run` first"
                ))
            }
            Err(err) => {
                return Err(err).with_context(|| format!("snapshot of '{}' failed", self.name))
            }
        };

        let path = data["path"].as_str().unwrap_or("<unknown>");
        if data["degraded"].as_bool().unwrap_or(false) {
            println!(
                "{} {} (network unreachable, cached state only)",
                "!".yellow().bold(),
                path
            );
        } else {
            println!("✓ {path}");
        }
        Ok(())
    }
}
