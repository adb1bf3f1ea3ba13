//! Snoop core library: domain types, watch-list persistence, errors.
//!
//! - [`types`]: newtypes and the persisted descriptor structs
//! - [`error`]: [`ConfigError`]
//! - [`config`]: load / save of the descriptor file
//! - [`paths`]: on-disk layout of a backup root

pub mod config;
pub mod error;
pub mod paths;
pub mod types;

pub use error::ConfigError;
pub use types::{Descriptor, EventId, SnoopConfig, WatcherName};
