//! `snoop stop` and `snoop status`.

use std::path::Path;

use anyhow::{Context, Result};

use snoop_core::paths::socket_path;
use snoop_daemon::{request_status, request_stop, DaemonError};

pub fn stop(root: &Path) -> Result<()> {
    match request_stop(root) {
        Ok(()) => println!("daemon stop requested"),
        Err(DaemonError::DaemonNotRunning { .. }) => println!("daemon is not running"),
        Err(err) => return Err(err).context("failed to stop daemon"),
    }
    Ok(())
}

pub fn status(root: &Path) -> Result<()> {
    let payload = match request_status(root) {
        Ok(status) => status,
        Err(DaemonError::DaemonNotRunning { .. }) => serde_json::json!({
            "running": false,
            "backup_root": root.display().to_string(),
            "socket": socket_path(root).display().to_string(),
        }),
        Err(err) => return Err(err).context("failed to query daemon status"),
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&payload).context("failed to render daemon status JSON")?
    );
    Ok(())
}
