//! Domain types for the snoop watch list.
//!
//! Names and event ids are plain newtypes; validation happens when a name is
//! used as a directory component, not when it is deserialized, so that one bad
//! descriptor never poisons the whole watch list.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Maximum length of a name produced by [`WatcherName::suggest`].
pub const SUGGESTED_NAME_MAX_CHARS: usize = 20;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Opaque, stable identifier of a remote event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub String);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for EventId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EventId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Human-assigned label of a watcher; also its on-disk namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WatcherName(pub String);

impl WatcherName {
    /// Parse and validate a watcher name.
    pub fn parse(value: impl Into<String>) -> Result<Self, ConfigError> {
        let name = Self(value.into());
        name.validate()?;
        Ok(name)
    }

    /// Check that the name is usable as a single directory component.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_component("watcher name", &self.0)
    }

    /// Default name for an event title: keeps `-`, `.`, space and ASCII
    /// alphanumerics, truncated to [`SUGGESTED_NAME_MAX_CHARS`].
    pub fn suggest(title: &str) -> Self {
        let cleaned: String = title
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | ' '))
            .take(SUGGESTED_NAME_MAX_CHARS)
            .collect();
        Self(cleaned)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WatcherName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for WatcherName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for WatcherName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Validate a snapshot label (same rules as a watcher name).
pub fn validate_label(label: &str) -> Result<(), ConfigError> {
    validate_component("snapshot label", label)
}

fn validate_component(kind: &'static str, value: &str) -> Result<(), ConfigError> {
    let reason = if value.trim().is_empty() {
        Some("must not be empty")
    } else if value == "." || value == ".." {
        Some("must not be a relative directory reference")
    } else if value.contains(['/', '\\', '\0']) {
        Some("must not contain path separators")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(ConfigError::InvalidName {
            kind,
            value: value.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Persisted structs
// ---------------------------------------------------------------------------

/// The persisted `{name, eventId}` record used to rebuild a watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub name: WatcherName,
    #[serde(rename = "eventId")]
    pub event_id: EventId,
}

impl Descriptor {
    pub fn new(name: impl Into<WatcherName>, event_id: impl Into<EventId>) -> Self {
        Self {
            name: name.into(),
            event_id: event_id.into(),
        }
    }
}

/// Top-level shape of the descriptor file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnoopConfig {
    pub snoops: Vec<Descriptor>,
}
