//! Watch-list persistence.
//!
//! # Storage layout
//!
//! ```text
//! <backup_root>/
//!   conspicuous-snoop-config.json   { "snoops": [ { "name": ..., "eventId": ... } ] }
//! ```
//!
//! A missing file is an empty watch list, never an error. Any other failure to
//! reach the file is a [`ConfigError::Io`], so callers never rewrite a watch
//! list they could not read. Malformed content is a hard [`ConfigError::Parse`]
//! and is not sanitized here.

use std::path::Path;

use crate::error::{io_err, ConfigError};
use crate::paths::config_path;
use crate::types::{Descriptor, SnoopConfig, WatcherName};

// ---------------------------------------------------------------------------
// 1. Load
// ---------------------------------------------------------------------------

/// Load the watch list stored under `root`.
///
/// Returns an empty [`SnoopConfig`] when the file does not exist or when the
/// path is occupied by something other than a regular file.
pub fn load_at(root: &Path) -> Result<SnoopConfig, ConfigError> {
    let path = config_path(root);
    let meta = match std::fs::metadata(&path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(SnoopConfig::default()),
        Err(e) => return Err(io_err(&path, e)),
    };
    if !meta.is_file() {
        return Ok(SnoopConfig::default());
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    serde_json::from_str(&contents).map_err(|e| ConfigError::Parse { path, source: e })
}

// ---------------------------------------------------------------------------
// 2. Save (atomic)
// ---------------------------------------------------------------------------

/// Atomically overwrite the watch list under `root`.
///
/// Write flow: serialize → `conspicuous-snoop-config.json.tmp` sibling → `rename`.
/// The root directory is created if it is missing.
pub fn save_at(root: &Path, config: &SnoopConfig) -> Result<(), ConfigError> {
    if !root.exists() {
        std::fs::create_dir_all(root).map_err(|e| io_err(root, e))?;
    }
    let path = config_path(root);
    let tmp_path = path.with_extension("json.tmp");

    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(&tmp_path, json).map_err(|e| io_err(&tmp_path, e))?;
    if let Err(e) = std::fs::rename(&tmp_path, &path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(io_err(&path, e));
    }
    Ok(())
}

/// Overwrite the watch list with exactly `descriptors`, in order.
pub fn save_descriptors_at<'a>(
    root: &Path,
    descriptors: impl IntoIterator<Item = &'a Descriptor>,
) -> Result<(), ConfigError> {
    let config = SnoopConfig {
        snoops: descriptors.into_iter().cloned().collect(),
    };
    save_at(root, &config)
}

// ---------------------------------------------------------------------------
// 3. Edit in place (used when no daemon owns the watch list)
// ---------------------------------------------------------------------------

/// Append a descriptor; rejects invalid or duplicate names.
pub fn add_descriptor_at(root: &Path, descriptor: Descriptor) -> Result<SnoopConfig, ConfigError> {
    descriptor.name.validate()?;
    let mut config = load_at(root)?;
    if config.snoops.iter().any(|d| d.name == descriptor.name) {
        return Err(ConfigError::DuplicateName {
            name: descriptor.name.0,
        });
    }
    config.snoops.push(descriptor);
    save_at(root, &config)?;
    Ok(config)
}

/// Remove the descriptor named `name`. Returns `false` if it was not listed.
pub fn remove_descriptor_at(root: &Path, name: &WatcherName) -> Result<bool, ConfigError> {
    let mut config = load_at(root)?;
    let before = config.snoops.len();
    config.snoops.retain(|d| &d.name != name);
    if config.snoops.len() == before {
        return Ok(false);
    }
    save_at(root, &config)?;
    Ok(true)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
