//! Error types for snoop-engine.

use std::path::PathBuf;

use thiserror::Error;

use snoop_core::{ConfigError, EventId};

/// Failures reported by an [`EventSource`](crate::source::EventSource).
///
/// Reasons are carried as strings so one failure can be fanned out to every
/// subscriber of a stream.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    /// The event is unknown to the source.
    #[error("event {event_id} not found")]
    NotFound { event_id: EventId },

    /// The source could not produce the event state right now.
    #[error("event {event_id} unavailable: {reason}")]
    Unavailable { event_id: EventId, reason: String },

    /// A live notification stream broke.
    #[error("{stream} stream for event {event_id} failed: {reason}")]
    Stream {
        event_id: EventId,
        stream: &'static str,
        reason: String,
    },
}

/// All errors that can arise from watcher and registry operations.
#[derive(Debug, Error)]
pub enum WatchError {
    /// Filesystem failure while preparing a namespace or writing a snapshot.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The cache-preferring read failed, so there is nothing to snapshot.
    #[error("event state unavailable: {0}")]
    Fetch(#[source] SourceError),

    /// Opening a live subscription failed.
    #[error("failed to subscribe to {stream} notifications: {source}")]
    Subscribe {
        stream: &'static str,
        #[source]
        source: SourceError,
    },

    /// Snapshot content could not be serialized.
    #[error("snapshot serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Watch-list persistence or name validation failed.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The watcher was stopped and cannot be re-armed.
    #[error("watcher '{name}' has been stopped")]
    Stopped { name: String },

    /// No watcher with that name is registered.
    #[error("no watcher named '{name}'")]
    UnknownWatcher { name: String },

    /// A background task panicked or was cancelled.
    #[error("task failure: {0}")]
    Task(String),
}

/// Convenience constructor for [`WatchError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> WatchError {
    WatchError::Io {
        path: path.into(),
        source,
    }
}
