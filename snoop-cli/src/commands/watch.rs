//! `snoop list`, `snoop add <event-id>` and `snoop remove <name>`.
//!
//! Each command goes through the running daemon when there is one, so the
//! live watch list and the descriptor file stay in step. Without a daemon the
//! descriptor file is edited directly and picked up by the next `snoop run`.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use chrono::DateTime;
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use serde_json::Value;
use tabled::{settings::Style, Table, Tabled};

use snoop_core::paths::{default_mirror_dir, rolling_path};
use snoop_core::{config, Descriptor, EventId, WatcherName};
use snoop_daemon::{request_add, request_remove, request_status, DaemonError};

// ---------------------------------------------------------------------------
// list
// ---------------------------------------------------------------------------

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, Serialize)]
struct WatchRow {
    name: String,
    event_id: String,
    rolling: String,
    state: String,
}

#[derive(Tabled)]
struct WatchTableRow {
    #[tabled(rename = "name")]
    name: String,
    #[tabled(rename = "event")]
    event_id: String,
    #[tabled(rename = "state")]
    state: String,
    #[tabled(rename = "rolling snapshot")]
    rolling: String,
}

impl ListArgs {
    pub fn run(self, root: &Path) -> Result<()> {
        let (rows, started_at) = match request_status(root) {
            Ok(status) => (rows_from_status(&status), status["started_at_unix"].as_i64()),
            Err(DaemonError::DaemonNotRunning { .. }) => (rows_from_config(root)?, None),
            Err(err) => return Err(err).context("failed to query daemon status"),
        };

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&rows).context("failed to serialize watch list")?
            );
            return Ok(());
        }

        match started_at.and_then(|secs| DateTime::from_timestamp(secs, 0)) {
            Some(since) => println!(
                "Snoop v{} | daemon up since {} | {} watched",
                env!("CARGO_PKG_VERSION"),
                since.format("%Y-%m-%d %H:%M:%S UTC"),
                rows.len()
            ),
            None => println!(
                "Snoop v{} | daemon {} | {} watched",
                env!("CARGO_PKG_VERSION"),
                "not running".bright_black(),
                rows.len()
            ),
        }
        if rows.is_empty() {
            println!("No events watched.");
            println!("Run: snoop add <event-id>");
            return Ok(());
        }

        let table_rows: Vec<WatchTableRow> = rows
            .into_iter()
            .map(|row| WatchTableRow {
                state: state_indicator(&row.state),
                name: row.name,
                event_id: row.event_id,
                rolling: row.rolling,
            })
            .collect();
        let mut table = Table::new(table_rows);
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}

fn rows_from_status(status: &Value) -> Vec<WatchRow> {
    status["watchers"]
        .as_array()
        .map(|watchers| {
            watchers
                .iter()
                .map(|w| WatchRow {
                    name: w["name"].as_str().unwrap_or_default().to_string(),
                    event_id: w["event_id"].as_str().unwrap_or_default().to_string(),
                    rolling: w["rolling"].as_str().unwrap_or_default().to_string(),
                    state: if w["subscribed"].as_bool().unwrap_or(false) {
                        "live".to_string()
                    } else {
                        "recovering".to_string()
                    },
                })
                .collect()
        })
        .unwrap_or_default()
}

fn rows_from_config(root: &Path) -> Result<Vec<WatchRow>> {
    let config = config::load_at(root)
        .with_context(|| format!("failed to load watch list under {}", root.display()))?;
    Ok(config
        .snoops
        .into_iter()
        .map(|d| WatchRow {
            rolling: rolling_path(root, &d.name).display().to_string(),
            name: d.name.0,
            event_id: d.event_id.0,
            state: "idle".to_string(),
        })
        .collect())
}

fn state_indicator(state: &str) -> String {
    match state {
        "live" => format!("{} live", "■".green().bold()),
        "recovering" => format!("{} recovering", "■".yellow().bold()),
        other => format!("{} {other}", "■".bright_black().bold()),
    }
}

// ---------------------------------------------------------------------------
// add
// ---------------------------------------------------------------------------

#[derive(Args, Debug)]
pub struct AddArgs {
    /// Event identifier, as used by the event service.
    pub event_id: String,

    /// Watcher name (also its folder under the backup root). Defaults to a
    /// name derived from the event title in the mirror file.
    #[arg(long, short = 'n')]
    pub name: Option<String>,

    /// Directory of `<event-id>.json` files; used to derive the default name.
    #[arg(long, env = "SNOOP_MIRROR_DIR", value_name = "DIR")]
    pub mirror_dir: Option<PathBuf>,
}

impl AddArgs {
    pub fn run(self, root: &Path) -> Result<()> {
        let mirror = self
            .mirror_dir
            .clone()
            .unwrap_or_else(|| default_mirror_dir(root));
        let name = match &self.name {
            Some(name) => WatcherName::parse(name.as_str())?,
            None => suggested_name(&mirror, &self.event_id)?,
        };

        match request_add(root, name.as_str(), &self.event_id) {
            Ok(data) => {
                println!("✓ Watching '{}' as '{}'", self.event_id, name);
                if let Some(rolling) = data["rolling"].as_str() {
                    println!("  Rolling snapshot: {rolling}");
                }
            }
            Err(DaemonError::DaemonNotRunning { .. }) => {
                config::add_descriptor_at(root, Descriptor::new(name.clone(), self.event_id.as_str()))
                    .with_context(|| format!("failed to add '{name}' to the watch list"))?;
                println!("✓ Added '{}' as '{}'", self.event_id, name);
                println!("  Daemon not running; it will start watching on `snoop run`.");
            }
            Err(err) => {
                return Err(err).with_context(|| format!("daemon refused to add '{name}'"))
            }
        }
        Ok(())
    }
}

/// Name derived from the `title` (or `name`) of the mirrored event file.
fn suggested_name(mirror: &Path, event_id: &str) -> Result<WatcherName> {
    let path = mirror.join(format!("{}.json", EventId::from(event_id)));
    let contents = std::fs::read_to_string(&path).with_context(|| {
        format!(
            "no --name given and event file {} is unreadable",
            path.display()
        )
    })?;
    let event: Value = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    let title = event["title"]
        .as_str()
        .or_else(|| event["name"].as_str())
        .ok_or_else(|| anyhow!("{} has no title; pass --name", path.display()))?;

    let name = WatcherName::suggest(title);
    name.validate()
        .with_context(|| format!("cannot derive a name from title '{title}'; pass --name"))?;
    Ok(name)
}

// ---------------------------------------------------------------------------
// remove
// ---------------------------------------------------------------------------

#[derive(Args, Debug)]
pub struct RemoveArgs {
    /// Watcher name, as shown by `snoop list`.
    pub name: String,
}

impl RemoveArgs {
    pub fn run(self, root: &Path) -> Result<()> {
        match request_remove(root, &self.name) {
            Ok(_) => {}
            Err(DaemonError::DaemonNotRunning { .. }) => {
                let removed =
                    config::remove_descriptor_at(root, &WatcherName::from(self.name.as_str()))
                        .context("failed to update the watch list")?;
                if !removed {
                    bail!("no watcher named '{}'", self.name);
                }
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to remove '{}'", self.name))
            }
        }
        println!("✓ Removed '{}'; existing snapshots are kept", self.name);
        Ok(())
    }
}
