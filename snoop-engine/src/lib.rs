//! # snoop-engine
//!
//! Snapshot capture for tournament events.
//!
//! A [`Watcher`] subscribes to one event through an [`EventSource`], keeps a
//! rolling snapshot current on every reported result, archives one snapshot
//! per new round, and re-arms itself when a subscription breaks. The
//! [`WatcherRegistry`] owns the live set and persists it via
//! [`snoop_core::config`] so [`load_all`] can rebuild it after a restart.

pub mod error;
pub mod memory;
pub mod mirror;
pub mod registry;
pub mod retry;
pub mod snapshot;
pub mod source;
pub mod watcher;

pub use error::{SourceError, WatchError};
pub use memory::MemorySource;
pub use mirror::MirrorSource;
pub use registry::{load_all, save_all, LoadFailure, LoadReport, PendingWatcher, WatcherRegistry};
pub use retry::RetryPolicy;
pub use snapshot::{Snapshot, SnapshotKind, DEGRADED_MARKER};
pub use source::{EventSource, EventState, FetchPolicy, ResultReported, Round};
pub use watcher::{round_label, Watcher};
