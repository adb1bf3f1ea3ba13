//! Per-event watcher: live subscriptions, snapshot triggers, self-healing.
//!
//! # Subscription generations
//!
//! Every (re)arm bumps a generation counter and installs a fresh pair of
//! notification pumps tagged with it. A pump only acts while its generation
//! is current, so callbacks from a superseded pair can neither trigger
//! snapshots nor schedule a second recovery. The pair is installed and torn
//! down as a unit: a watcher holds two live subscriptions or none.
//!
//! # Recovery
//!
//! The first failure of a generation tears the pair down and schedules one
//! re-arm after a [`RetryPolicy`] delay. Failed re-arms schedule the next
//! attempt with a longer delay; the counter resets once a notification is
//! delivered on a fresh pair.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use snoop_core::paths::{self, ROLLING_LABEL};
use snoop_core::types::validate_label;
use snoop_core::{Descriptor, EventId, WatcherName};

use crate::error::{io_err, WatchError};
use crate::retry::RetryPolicy;
use crate::snapshot::{
    archival_file_name, effective_label, render, resolve_content, write_atomic, RollingStatus,
    Snapshot, SnapshotKind,
};
use crate::source::{EventSource, Notifications, ResultReported, Round};

/// Label of the archival snapshot taken when round `number` starts.
pub fn round_label(number: u64) -> String {
    format!("round-{number}-auto")
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

struct SubscriptionPair {
    results: JoinHandle<()>,
    rounds: JoinHandle<()>,
}

impl SubscriptionPair {
    fn abort(&self) {
        self.results.abort();
        self.rounds.abort();
    }

    /// Abort both pumps and wait until their receivers are dropped.
    async fn shutdown(self) {
        self.abort();
        let _ = self.results.await;
        let _ = self.rounds.await;
    }
}

#[derive(Default)]
struct Subscriptions {
    generation: u64,
    pair: Option<SubscriptionPair>,
    stopped: bool,
    recovering: Option<u64>,
    failures: u32,
    recovery: Option<JoinHandle<()>>,
}

struct Inner {
    event_id: EventId,
    name: WatcherName,
    backup_root: PathBuf,
    source: Arc<dyn EventSource>,
    retry: RetryPolicy,
    subs: Mutex<Subscriptions>,
}

/// Watches one event and snapshots it under `<backup_root>/<name>/`.
///
/// Cloning is cheap; clones share subscriptions.
#[derive(Clone)]
pub struct Watcher {
    inner: Arc<Inner>,
}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("name", &self.inner.name)
            .field("event_id", &self.inner.event_id)
            .field("backup_root", &self.inner.backup_root)
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

impl fmt::Display for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.inner.name, self.inner.event_id)
    }
}

impl Watcher {
    pub fn new(
        event_id: EventId,
        name: WatcherName,
        backup_root: impl Into<PathBuf>,
        source: Arc<dyn EventSource>,
    ) -> Result<Self, WatchError> {
        Self::with_retry(event_id, name, backup_root, source, RetryPolicy::default())
    }

    pub fn with_retry(
        event_id: EventId,
        name: WatcherName,
        backup_root: impl Into<PathBuf>,
        source: Arc<dyn EventSource>,
        retry: RetryPolicy,
    ) -> Result<Self, WatchError> {
        name.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                event_id,
                name,
                backup_root: backup_root.into(),
                source,
                retry,
                subs: Mutex::new(Subscriptions::default()),
            }),
        })
    }

    pub fn event_id(&self) -> &EventId {
        &self.inner.event_id
    }

    pub fn name(&self) -> &WatcherName {
        &self.inner.name
    }

    pub fn backup_root(&self) -> &Path {
        &self.inner.backup_root
    }

    /// `<backup_root>/<name>/`
    pub fn dir(&self) -> PathBuf {
        paths::watcher_dir(&self.inner.backup_root, &self.inner.name)
    }

    pub fn rolling_path(&self) -> PathBuf {
        paths::rolling_path(&self.inner.backup_root, &self.inner.name)
    }

    pub fn descriptor(&self) -> Descriptor {
        Descriptor {
            name: self.inner.name.clone(),
            event_id: self.inner.event_id.clone(),
        }
    }

    /// Live subscriptions held by this watcher: always 0 or 2.
    pub fn subscription_count(&self) -> usize {
        if self.lock().pair.is_some() {
            2
        } else {
            0
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Create the namespace, arm subscriptions, and return the path of the
    /// rolling snapshot taken while arming.
    pub async fn start(&self) -> Result<PathBuf, WatchError> {
        let snapshots = paths::snapshots_dir(&self.inner.backup_root, &self.inner.name);
        tokio::fs::create_dir_all(&snapshots)
            .await
            .map_err(|e| io_err(&snapshots, e))?;

        let rolling = self.resubscribe().await?;
        tracing::info!(
            watcher = %self.inner.name,
            event = %self.inner.event_id,
            path = %rolling.display(),
            "watcher started",
        );
        Ok(rolling)
    }

    /// Tear down any live pair, subscribe afresh, then take a rolling
    /// snapshot and return its path.
    pub async fn resubscribe(&self) -> Result<PathBuf, WatchError> {
        self.arm().await.map_err(|(_, err)| err)?;
        let snapshot = self.take_snapshot(ROLLING_LABEL, SnapshotKind::Rolling).await?;
        Ok(snapshot.path)
    }

    /// Unsubscribe permanently. Snapshots already in flight still complete.
    pub fn stop(&self) {
        let mut subs = self.lock();
        if subs.stopped {
            return;
        }
        subs.stopped = true;
        subs.generation += 1;
        if let Some(pair) = subs.pair.take() {
            pair.abort();
        }
        if let Some(recovery) = subs.recovery.take() {
            recovery.abort();
        }
        drop(subs);
        tracing::info!(watcher = %self.inner.name, "watcher stopped");
    }

    /// Returns the generation that was armed, or the generation that failed.
    async fn arm(&self) -> Result<u64, (u64, WatchError)> {
        let (generation, old) = {
            let mut subs = self.lock();
            if subs.stopped {
                return Err((subs.generation, self.stopped_error()));
            }
            subs.generation += 1;
            (subs.generation, subs.pair.take())
        };
        if let Some(old) = old {
            old.shutdown().await;
        }

        let source = &self.inner.source;
        let event_id = &self.inner.event_id;
        let results = source
            .subscribe_results(event_id)
            .await
            .map_err(|source| (generation, WatchError::Subscribe { stream: "result", source }))?;
        let rounds = source
            .subscribe_rounds(event_id)
            .await
            .map_err(|source| (generation, WatchError::Subscribe { stream: "round", source }))?;

        let mut subs = self.lock();
        if subs.stopped {
            return Err((generation, self.stopped_error()));
        }
        if subs.generation != generation {
            tracing::debug!(
                watcher = %self.inner.name,
                generation,
                "arm superseded by a newer generation",
            );
            return Ok(generation);
        }

        let weak = Arc::downgrade(&self.inner);
        subs.pair = Some(SubscriptionPair {
            results: tokio::spawn(pump(
                weak.clone(),
                generation,
                "result",
                results,
                |watcher: &Watcher, _: ResultReported| {
                    watcher.spawn_snapshot(ROLLING_LABEL.to_string(), SnapshotKind::Rolling)
                },
            )),
            rounds: tokio::spawn(pump(
                weak,
                generation,
                "round",
                rounds,
                |watcher: &Watcher, round: Round| {
                    watcher.spawn_snapshot(round_label(round.number), SnapshotKind::Archival)
                },
            )),
        });
        tracing::debug!(watcher = %self.inner.name, generation, "subscriptions armed");
        Ok(generation)
    }

    fn on_stream_failure(&self, generation: u64) {
        let mut subs = self.lock();
        if subs.stopped || subs.generation != generation || subs.recovering == Some(generation) {
            return;
        }
        subs.recovering = Some(generation);
        if let Some(pair) = subs.pair.take() {
            pair.abort();
        }

        let delay = self.inner.retry.delay_for(subs.failures);
        subs.failures = subs.failures.saturating_add(1);
        tracing::warn!(
            watcher = %self.inner.name,
            attempt = subs.failures,
            delay_ms = delay.as_millis() as u64,
            "subscriptions lost; re-arming after backoff",
        );
        subs.recovery = Some(tokio::spawn(recover(
            Arc::downgrade(&self.inner),
            generation,
            delay,
        )));
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    /// Resolve content and write one snapshot. Rolling snapshots always land
    /// in `rolling.json` and also refresh the `rolling.status.json` sidecar.
    pub async fn take_snapshot(
        &self,
        label: &str,
        kind: SnapshotKind,
    ) -> Result<Snapshot, WatchError> {
        self.take_snapshot_at(label, kind, Utc::now()).await
    }

    /// [`take_snapshot`](Self::take_snapshot) with an explicit capture time.
    pub async fn take_snapshot_at(
        &self,
        label: &str,
        kind: SnapshotKind,
        captured_at: DateTime<Utc>,
    ) -> Result<Snapshot, WatchError> {
        validate_label(label)?;
        let resolved = resolve_content(self.inner.source.as_ref(), &self.inner.event_id)
            .await
            .map_err(WatchError::Fetch)?;
        let effective = effective_label(label, resolved.degraded);
        let body = render(&resolved.state)?;

        let path = match kind {
            SnapshotKind::Rolling => self.rolling_path(),
            SnapshotKind::Archival => paths::snapshots_dir(&self.inner.backup_root, &self.inner.name)
                .join(archival_file_name(captured_at, &effective)),
        };
        write_atomic(&path, &body).await?;

        let snapshot = Snapshot {
            path,
            label: effective,
            degraded: resolved.degraded,
            captured_at,
        };
        if kind == SnapshotKind::Rolling {
            let status_path = paths::rolling_status_path(&self.inner.backup_root, &self.inner.name);
            self.write_rolling_status(&status_path, &snapshot).await;
        }

        if snapshot.degraded {
            tracing::warn!(
                watcher = %self.inner.name,
                label = %snapshot.label,
                path = %snapshot.path.display(),
                "snapshot written from cache only",
            );
        } else {
            tracing::info!(
                watcher = %self.inner.name,
                label = %snapshot.label,
                path = %snapshot.path.display(),
                "snapshot written",
            );
        }
        Ok(snapshot)
    }

    async fn write_rolling_status(&self, path: &Path, snapshot: &Snapshot) {
        let status = RollingStatus {
            label: snapshot.label.clone(),
            degraded: snapshot.degraded,
            captured_at: snapshot.captured_at,
        };
        let result = match serde_json::to_string_pretty(&status) {
            Ok(body) => write_atomic(path, &body).await,
            Err(err) => Err(err.into()),
        };
        if let Err(err) = result {
            tracing::warn!(
                watcher = %self.inner.name,
                path = %path.display(),
                error = %err,
                "failed to write rolling status",
            );
        }
    }

    /// Fire-and-forget snapshot for notification handlers.
    fn spawn_snapshot(&self, label: String, kind: SnapshotKind) {
        let watcher = self.clone();
        tokio::spawn(async move {
            if let Err(err) = watcher.take_snapshot(&label, kind).await {
                tracing::error!(
                    watcher = %watcher.inner.name,
                    label = %label,
                    error = %err,
                    "triggered snapshot failed",
                );
            }
        });
    }

    fn is_current(&self, generation: u64) -> bool {
        let subs = self.lock();
        !subs.stopped && subs.generation == generation
    }

    fn stopped_error(&self) -> WatchError {
        WatchError::Stopped {
            name: self.inner.name.0.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Subscriptions> {
        self.inner.subs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

async fn pump<T, F>(
    weak: Weak<Inner>,
    generation: u64,
    stream: &'static str,
    mut notifications: Notifications<T>,
    on_item: F,
) where
    T: Send + 'static,
    F: Fn(&Watcher, T) + Send + 'static,
{
    loop {
        let item = notifications.recv().await;
        let Some(inner) = weak.upgrade() else { return };
        let watcher = Watcher { inner };

        match item {
            Some(Ok(value)) => {
                // Dispatch under the lock so `stop` strictly orders against it.
                let mut subs = watcher.lock();
                if subs.stopped || subs.generation != generation {
                    return;
                }
                subs.failures = 0;
                on_item(&watcher, value);
            }
            Some(Err(err)) => {
                tracing::warn!(
                    watcher = %watcher.inner.name,
                    stream,
                    generation,
                    error = %err,
                    "notification stream failed",
                );
                watcher.on_stream_failure(generation);
                return;
            }
            None => {
                tracing::warn!(
                    watcher = %watcher.inner.name,
                    stream,
                    generation,
                    "notification stream closed",
                );
                watcher.on_stream_failure(generation);
                return;
            }
        }
    }
}

async fn recover(weak: Weak<Inner>, generation: u64, delay: Duration) {
    tokio::time::sleep(delay).await;
    let Some(inner) = weak.upgrade() else { return };
    let watcher = Watcher { inner };
    if !watcher.is_current(generation) {
        return;
    }

    match watcher.arm().await {
        Ok(armed) => {
            tracing::info!(watcher = %watcher.inner.name, generation = armed, "subscriptions re-armed");
            if let Err(err) = watcher
                .take_snapshot(ROLLING_LABEL, SnapshotKind::Rolling)
                .await
            {
                tracing::error!(
                    watcher = %watcher.inner.name,
                    error = %err,
                    "rolling snapshot after re-arm failed",
                );
            }
        }
        Err((_, WatchError::Stopped { .. })) => {}
        Err((failed, err)) => {
            tracing::warn!(watcher = %watcher.inner.name, error = %err, "re-arm failed");
            watcher.on_stream_failure(failed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    use crate::memory::MemorySource;

    fn fixture() -> (TempDir, Arc<MemorySource>, Watcher) {
        let root = TempDir::new().expect("tempdir");
        let source = Arc::new(MemorySource::new());
        source.insert_event(EventId::from("evt-1"), json!({"round": 1}));
        let watcher = Watcher::with_retry(
            EventId::from("evt-1"),
            WatcherName::from("GP-Chicago"),
            root.path(),
            source.clone(),
            RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(40)),
        )
        .expect("watcher");
        (root, source, watcher)
    }

    #[test]
    fn round_label_format() {
        assert_eq!(round_label(3), "round-3-auto");
    }

    #[test]
    fn invalid_name_is_rejected_at_construction() {
        let source: Arc<dyn EventSource> = Arc::new(MemorySource::new());
        let err = Watcher::new(
            EventId::from("evt-1"),
            WatcherName::from("../escape"),
            "/tmp",
            source,
        )
        .unwrap_err();
        assert!(matches!(err, WatchError::Config(_)), "got: {err}");
    }

    #[test]
    fn display_combines_name_and_event() {
        let (_root, _source, watcher) = fixture();
        assert_eq!(watcher.to_string(), "GP-Chicago (evt-1)");
    }

    #[tokio::test]
    async fn stale_generation_failure_is_ignored() {
        let (_root, _source, watcher) = fixture();
        watcher.start().await.expect("start");
        let current = watcher.lock().generation;

        watcher.on_stream_failure(current - 1);
        assert_eq!(watcher.subscription_count(), 2);
        assert!(watcher.lock().recovery.is_none());
    }

    #[tokio::test]
    async fn second_failure_of_a_generation_schedules_nothing() {
        let (_root, _source, watcher) = fixture();
        watcher.start().await.expect("start");
        let current = watcher.lock().generation;

        watcher.on_stream_failure(current);
        assert_eq!(watcher.subscription_count(), 0);
        assert_eq!(watcher.lock().failures, 1);

        watcher.on_stream_failure(current);
        assert_eq!(watcher.lock().failures, 1, "one recovery per generation");
    }

    #[tokio::test]
    async fn start_after_stop_is_refused() {
        let (_root, _source, watcher) = fixture();
        watcher.stop();
        let err = watcher.start().await.unwrap_err();
        assert!(matches!(err, WatchError::Stopped { .. }), "got: {err}");
    }
}
