//! On-disk layout of a backup root.
//!
//! ```text
//! <root>/
//!   conspicuous-snoop-config.json   (watch list)
//!   .snoop/snoop.sock               (daemon control socket)
//!   .mirror/<event_id>.json         (default mirror directory)
//!   <name>/
//!     rolling.json
//!     rolling.status.json
//!     snapshots/<timestamp>.<label>.json
//! ```
//!
//! All functions are pure; none of them touch the filesystem.

use std::path::{Path, PathBuf};

use crate::types::WatcherName;

pub const CONFIG_FILE_NAME: &str = "conspicuous-snoop-config.json";
pub const SNAPSHOTS_DIR: &str = "snapshots";
pub const ROLLING_LABEL: &str = "rolling";
pub const ROLLING_STATUS_FILE: &str = "rolling.status.json";
pub const RUNTIME_DIR: &str = ".snoop";
pub const SOCKET_FILE: &str = "snoop.sock";
pub const MIRROR_DIR: &str = ".mirror";

/// `<root>/conspicuous-snoop-config.json`
pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE_NAME)
}

/// `<root>/<name>/`
pub fn watcher_dir(root: &Path, name: &WatcherName) -> PathBuf {
    root.join(&name.0)
}

/// `<root>/<name>/snapshots/`
pub fn snapshots_dir(root: &Path, name: &WatcherName) -> PathBuf {
    watcher_dir(root, name).join(SNAPSHOTS_DIR)
}

/// `<root>/<name>/rolling.json`
pub fn rolling_path(root: &Path, name: &WatcherName) -> PathBuf {
    watcher_dir(root, name).join(format!("{ROLLING_LABEL}.json"))
}

/// `<root>/<name>/rolling.status.json`
pub fn rolling_status_path(root: &Path, name: &WatcherName) -> PathBuf {
    watcher_dir(root, name).join(ROLLING_STATUS_FILE)
}

/// `<root>/.snoop/`
pub fn runtime_dir(root: &Path) -> PathBuf {
    root.join(RUNTIME_DIR)
}

/// `<root>/.snoop/snoop.sock`
pub fn socket_path(root: &Path) -> PathBuf {
    runtime_dir(root).join(SOCKET_FILE)
}

/// `<root>/.mirror/`
pub fn default_mirror_dir(root: &Path) -> PathBuf {
    root.join(MIRROR_DIR)
}
