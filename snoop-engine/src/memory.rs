//! In-process [`EventSource`] with scriptable state, connectivity and
//! notifications. Useful for embedding and for exercising watchers without a
//! remote service.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use snoop_core::EventId;

use crate::error::SourceError;
use crate::source::{EventSource, EventState, FetchPolicy, Notifications, ResultReported, Round};

type Sender<T> = mpsc::UnboundedSender<Result<T, SourceError>>;

#[derive(Debug, Default)]
struct EventEntry {
    remote: EventState,
    cached: Option<EventState>,
}

#[derive(Debug)]
struct MemoryState {
    events: HashMap<EventId, EventEntry>,
    network_available: bool,
    subscribe_failure: Option<String>,
    results: HashMap<EventId, Vec<Sender<ResultReported>>>,
    rounds: HashMap<EventId, Vec<Sender<Round>>>,
    fetches: Vec<FetchPolicy>,
    latency: Duration,
}

#[derive(Debug)]
pub struct MemorySource {
    state: Mutex<MemoryState>,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                events: HashMap::new(),
                network_available: true,
                subscribe_failure: None,
                results: HashMap::new(),
                rounds: HashMap::new(),
                fetches: Vec::new(),
                latency: Duration::ZERO,
            }),
        }
    }

    /// Set the authoritative ("remote") state of an event. The cached copy
    /// only changes on the next successful network read.
    pub fn insert_event(&self, event_id: EventId, state: EventState) {
        self.lock().events.entry(event_id).or_default().remote = state;
    }

    /// Toggle whether network reads succeed.
    pub fn set_network_available(&self, available: bool) {
        self.lock().network_available = available;
    }

    /// Delay every fetch by `latency`, like a slow network.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Make every subscribe call fail with `reason` until cleared with `None`.
    pub fn set_subscribe_failure(&self, reason: Option<&str>) {
        self.lock().subscribe_failure = reason.map(str::to_string);
    }

    /// Deliver a result-reported notification. Returns the number of live
    /// subscribers that received it.
    pub fn push_result(&self, event_id: &EventId) -> usize {
        let mut state = self.lock();
        deliver(state.results.get_mut(event_id), Ok(ResultReported))
    }

    /// Deliver a round-change notification.
    pub fn push_round(&self, event_id: &EventId, number: u64) -> usize {
        let mut state = self.lock();
        deliver(state.rounds.get_mut(event_id), Ok(Round { number }))
    }

    /// Break every live stream of `event_id` with an error and drop it.
    pub fn fail_streams(&self, event_id: &EventId, reason: &str) {
        let mut state = self.lock();
        for sender in state.results.remove(event_id).unwrap_or_default() {
            let _ = sender.send(Err(stream_error(event_id, "result", reason)));
        }
        for sender in state.rounds.remove(event_id).unwrap_or_default() {
            let _ = sender.send(Err(stream_error(event_id, "round", reason)));
        }
    }

    /// Number of subscriptions for `event_id` whose receiver is still alive.
    pub fn live_subscriptions(&self, event_id: &EventId) -> usize {
        let state = self.lock();
        let live_results = state
            .results
            .get(event_id)
            .map(|senders| senders.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0);
        let live_rounds = state
            .rounds
            .get(event_id)
            .map(|senders| senders.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0);
        live_results + live_rounds
    }

    /// Every fetch policy requested so far, in call order.
    pub fn fetches(&self) -> Vec<FetchPolicy> {
        self.lock().fetches.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_subscribe(
        state: &MemoryState,
        event_id: &EventId,
        stream: &'static str,
    ) -> Result<(), SourceError> {
        if !state.events.contains_key(event_id) {
            return Err(SourceError::NotFound {
                event_id: event_id.clone(),
            });
        }
        if let Some(reason) = &state.subscribe_failure {
            return Err(stream_error(event_id, stream, reason));
        }
        Ok(())
    }
}

#[async_trait]
impl EventSource for MemorySource {
    async fn subscribe_results(
        &self,
        event_id: &EventId,
    ) -> Result<Notifications<ResultReported>, SourceError> {
        let mut state = self.lock();
        Self::check_subscribe(&state, event_id, "result")?;
        let (tx, rx) = mpsc::unbounded_channel();
        let senders = state.results.entry(event_id.clone()).or_default();
        senders.retain(|s| !s.is_closed());
        senders.push(tx);
        Ok(rx)
    }

    async fn subscribe_rounds(
        &self,
        event_id: &EventId,
    ) -> Result<Notifications<Round>, SourceError> {
        let mut state = self.lock();
        Self::check_subscribe(&state, event_id, "round")?;
        let (tx, rx) = mpsc::unbounded_channel();
        let senders = state.rounds.entry(event_id.clone()).or_default();
        senders.retain(|s| !s.is_closed());
        senders.push(tx);
        Ok(rx)
    }

    async fn fetch_event(
        &self,
        event_id: &EventId,
        policy: FetchPolicy,
    ) -> Result<EventState, SourceError> {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.lock();
        state.fetches.push(policy);
        let network_available = state.network_available;
        let entry = state
            .events
            .get_mut(event_id)
            .ok_or_else(|| SourceError::NotFound {
                event_id: event_id.clone(),
            })?;

        if policy == FetchPolicy::CacheFirst {
            if let Some(cached) = &entry.cached {
                return Ok(cached.clone());
            }
        }
        if !network_available {
            return Err(SourceError::Unavailable {
                event_id: event_id.clone(),
                reason: "network unavailable".to_string(),
            });
        }
        entry.cached = Some(entry.remote.clone());
        Ok(entry.remote.clone())
    }
}

fn deliver<T: Clone>(
    senders: Option<&mut Vec<Sender<T>>>,
    item: Result<T, SourceError>,
) -> usize {
    let Some(senders) = senders else { return 0 };
    senders.retain(|s| s.send(item.clone()).is_ok());
    senders.len()
}

fn stream_error(event_id: &EventId, stream: &'static str, reason: &str) -> SourceError {
    SourceError::Stream {
        event_id: event_id.clone(),
        stream,
        reason: reason.to_string(),
    }
}
