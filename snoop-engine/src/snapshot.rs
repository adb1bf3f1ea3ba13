//! Snapshot content resolution and atomic writes.
//!
//! ## Content resolution
//!
//! 1. Cache-preferring read. Failure here fails the snapshot.
//! 2. Network-only read.
//! 3. If step 2 succeeds its result is used as-is.
//! 4. Otherwise step 1's result is used and the label gains
//!    [`DEGRADED_MARKER`].
//!
//! ## `write_atomic`
//!
//! 1. Ensure the parent directory exists.
//! 2. Write to a unique `.<file>.<pid>-<seq>.tmp` sibling.
//! 3. Rename to the final path (atomic on POSIX).
//!
//! Concurrent writers to the same path never observe each other's partial
//! output; the last rename wins.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use snoop_core::EventId;

use crate::error::{io_err, SourceError, WatchError};
use crate::source::{EventSource, EventState, FetchPolicy};

/// Label suffix for snapshots produced without a successful network read.
pub const DEGRADED_MARKER: &str = ".FROM-CACHE-ONLY";

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Where a snapshot lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    /// `<name>/<label>.json`, overwritten on every capture.
    Rolling,
    /// `<name>/snapshots/<timestamp>.<label>.json`, never overwritten.
    #[default]
    Archival,
}

/// A snapshot that has been written to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub path: PathBuf,
    /// Effective label, including [`DEGRADED_MARKER`] when degraded.
    pub label: String,
    pub degraded: bool,
    pub captured_at: DateTime<Utc>,
}

/// Event state chosen by [`resolve_content`].
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub state: EventState,
    pub degraded: bool,
}

/// Sidecar written next to a rolling snapshot so degraded status is not lost
/// behind the fixed filename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollingStatus {
    pub label: String,
    pub degraded: bool,
    pub captured_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Cache read first, then a network read that falls back to the cached copy.
pub async fn resolve_content(
    source: &dyn EventSource,
    event_id: &EventId,
) -> Result<Resolved, SourceError> {
    let cached = source.fetch_event(event_id, FetchPolicy::CacheFirst).await?;
    match source.fetch_event(event_id, FetchPolicy::NetworkOnly).await {
        Ok(state) => Ok(Resolved {
            state,
            degraded: false,
        }),
        Err(err) => {
            tracing::warn!(event = %event_id, error = %err, "network read failed, using cached state");
            Ok(Resolved {
                state: cached,
                degraded: true,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Naming
// ---------------------------------------------------------------------------

/// `2024-05-04_13-07-09`: sortable, whole seconds, no colons.
pub fn timestamp_string(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d_%H-%M-%S").to_string()
}

/// Append [`DEGRADED_MARKER`] when `degraded`.
pub fn effective_label(label: &str, degraded: bool) -> String {
    if degraded {
        format!("{label}{DEGRADED_MARKER}")
    } else {
        label.to_string()
    }
}

/// `<timestamp>.<label>.json`
pub fn archival_file_name(at: DateTime<Utc>, label: &str) -> String {
    format!("{}.{label}.json", timestamp_string(at))
}

/// Two-space indented JSON.
pub fn render(state: &EventState) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(state)
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

/// Atomically create or replace `path` with `content`.
pub async fn write_atomic(path: &Path, content: &str) -> Result<(), WatchError> {
    let tmp = tmp_path_for(path);
    write_atomic_with_tmp(path, content, &tmp).await
}

async fn write_atomic_with_tmp(path: &Path, content: &str, tmp: &Path) -> Result<(), WatchError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_err(parent, e))?;
    }

    if let Err(e) = tokio::fs::write(tmp, content).await {
        let _ = tokio::fs::remove_file(tmp).await;
        return Err(io_err(tmp, e));
    }

    if let Err(e) = tokio::fs::rename(tmp, path).await {
        let _ = tokio::fs::remove_file(tmp).await;
        return Err(io_err(path, e));
    }
    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{file_name}.{}-{seq}.tmp", std::process::id()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
