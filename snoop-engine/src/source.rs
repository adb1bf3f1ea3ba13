//! The capability a watcher is handed: live notifications plus event-state
//! reads with a cache/network selector.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use snoop_core::EventId;

use crate::error::SourceError;

/// Opaque, JSON-serializable event state.
pub type EventState = serde_json::Value;

/// A live notification stream. An `Err` item or the end of the stream means
/// the subscription is gone; dropping the receiver unsubscribes.
pub type Notifications<T> = mpsc::UnboundedReceiver<Result<T, SourceError>>;

/// Which copy of the event state a read may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchPolicy {
    /// Prefer a cached copy; tolerate staleness.
    CacheFirst,
    /// Require a fresh read; fail if the service is unreachable.
    NetworkOnly,
}

/// Signal that a match result was reported. Carries no payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultReported;

/// The current round of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Round {
    pub number: u64,
}

#[async_trait]
pub trait EventSource: Send + Sync + 'static {
    /// Subscribe to "result reported" notifications for `event_id`.
    async fn subscribe_results(
        &self,
        event_id: &EventId,
    ) -> Result<Notifications<ResultReported>, SourceError>;

    /// Subscribe to "current round changed" notifications for `event_id`.
    async fn subscribe_rounds(&self, event_id: &EventId)
        -> Result<Notifications<Round>, SourceError>;

    /// Read the event state under `policy`.
    async fn fetch_event(
        &self,
        event_id: &EventId,
        policy: FetchPolicy,
    ) -> Result<EventState, SourceError>;
}
