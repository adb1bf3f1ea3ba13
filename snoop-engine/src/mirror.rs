//! [`EventSource`] over a directory of `<event_id>.json` files kept current by
//! an external exporter.
//!
//! - `NetworkOnly` reads and parses the file, refreshing the in-memory cache.
//! - `CacheFirst` returns the cached copy, reading the file on a miss.
//! - Result notifications fire on create/modify of the event file, debounced:
//!   the first write of a burst notifies at once, and one more notification
//!   follows when the window closes if further writes arrived meanwhile.
//! - Round notifications fire when the value at the round pointer changes.
//!
//! Each subscription owns its own `notify` watcher; dropping the receiver
//! ends the task and releases the watcher.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;

use snoop_core::EventId;

use crate::error::SourceError;
use crate::source::{EventSource, EventState, FetchPolicy, Notifications, ResultReported, Round};

pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);
pub const DEFAULT_ROUND_POINTER: &str = "/currentRound/number";

pub struct MirrorSource {
    dir: PathBuf,
    round_pointer: String,
    debounce: Duration,
    cache: Mutex<HashMap<EventId, EventState>>,
}

impl std::fmt::Debug for MirrorSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorSource")
            .field("dir", &self.dir)
            .field("round_pointer", &self.round_pointer)
            .field("debounce", &self.debounce)
            .finish()
    }
}

impl MirrorSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            round_pointer: DEFAULT_ROUND_POINTER.to_string(),
            debounce: DEBOUNCE_WINDOW,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// JSON pointer of the current round number inside an event file.
    pub fn with_round_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.round_pointer = pointer.into();
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<dir>/<event_id>.json`
    pub fn event_path(&self, event_id: &EventId) -> PathBuf {
        self.dir.join(format!("{}.json", event_id.0))
    }

    async fn read_event(&self, event_id: &EventId) -> Result<EventState, SourceError> {
        read_event_file(&self.event_path(event_id), event_id).await
    }

    fn lock_cache(&self) -> MutexGuard<'_, HashMap<EventId, EventState>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a `notify` watcher on the mirror directory for one event file.
    fn watch(
        &self,
        event_id: &EventId,
        stream: &'static str,
    ) -> Result<(RecommendedWatcher, mpsc::UnboundedReceiver<notify::Result<Event>>), SourceError>
    {
        let path = self.event_path(event_id);
        if !path.is_file() {
            return Err(SourceError::NotFound {
                event_id: event_id.clone(),
            });
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let to_source_error = |err: notify::Error| SourceError::Stream {
            event_id: event_id.clone(),
            stream,
            reason: err.to_string(),
        };
        let mut watcher = recommended_watcher(move |event| {
            let _ = event_tx.send(event);
        })
        .map_err(to_source_error)?;
        watcher
            .watch(&self.dir, RecursiveMode::NonRecursive)
            .map_err(to_source_error)?;
        tracing::debug!(event = %event_id, stream, dir = %self.dir.display(), "watching mirror directory");
        Ok((watcher, event_rx))
    }
}

#[async_trait]
impl EventSource for MirrorSource {
    async fn subscribe_results(
        &self,
        event_id: &EventId,
    ) -> Result<Notifications<ResultReported>, SourceError> {
        let (watcher, mut events) = self.watch(event_id, "result")?;
        let (tx, rx) = mpsc::unbounded_channel();
        let path = self.event_path(event_id);
        let event_id = event_id.clone();
        let debounce = self.debounce;

        tokio::spawn(async move {
            let _watcher = watcher;
            let mut debounce = Debounce::new(debounce);
            loop {
                let trailing = debounce.trailing_deadline();
                let flush_at = trailing.unwrap_or_else(Instant::now);
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = tokio::time::sleep_until(flush_at), if trailing.is_some() => {
                        debounce.flush(Instant::now());
                        if tx.send(Ok(ResultReported)).is_err() {
                            break;
                        }
                    }
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        match event {
                            Ok(event) if touches(&event, &path) => {
                                if debounce.hit(Instant::now())
                                    && tx.send(Ok(ResultReported)).is_err()
                                {
                                    break;
                                }
                            }
                            Ok(_) => {}
                            Err(err) => {
                                let _ = tx.send(Err(SourceError::Stream {
                                    event_id: event_id.clone(),
                                    stream: "result",
                                    reason: err.to_string(),
                                }));
                                break;
                            }
                        }
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn subscribe_rounds(
        &self,
        event_id: &EventId,
    ) -> Result<Notifications<Round>, SourceError> {
        let (watcher, mut events) = self.watch(event_id, "round")?;
        let (tx, rx) = mpsc::unbounded_channel();
        let path = self.event_path(event_id);
        let pointer = self.round_pointer.clone();
        let event_id = event_id.clone();
        let mut last_round = read_event_file(&path, &event_id)
            .await
            .ok()
            .and_then(|state| round_at(&state, &pointer));

        tokio::spawn(async move {
            let _watcher = watcher;
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        match event {
                            Ok(event) if touches(&event, &path) => {
                                let Ok(state) = read_event_file(&path, &event_id).await else {
                                    continue;
                                };
                                let Some(number) = round_at(&state, &pointer) else { continue };
                                if last_round == Some(number) {
                                    continue;
                                }
                                last_round = Some(number);
                                if tx.send(Ok(Round { number })).is_err() {
                                    break;
                                }
                            }
                            Ok(_) => {}
                            Err(err) => {
                                let _ = tx.send(Err(SourceError::Stream {
                                    event_id: event_id.clone(),
                                    stream: "round",
                                    reason: err.to_string(),
                                }));
                                break;
                            }
                        }
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn fetch_event(
        &self,
        event_id: &EventId,
        policy: FetchPolicy,
    ) -> Result<EventState, SourceError> {
        if policy == FetchPolicy::CacheFirst {
            if let Some(cached) = self.lock_cache().get(event_id).cloned() {
                return Ok(cached);
            }
        }
        let state = self.read_event(event_id).await?;
        self.lock_cache().insert(event_id.clone(), state.clone());
        Ok(state)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn read_event_file(path: &Path, event_id: &EventId) -> Result<EventState, SourceError> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(SourceError::NotFound {
                event_id: event_id.clone(),
            })
        }
        Err(err) => {
            return Err(SourceError::Unavailable {
                event_id: event_id.clone(),
                reason: format!("{}: {err}", path.display()),
            })
        }
    };
    serde_json::from_str(&contents).map_err(|err| SourceError::Unavailable {
        event_id: event_id.clone(),
        reason: format!("{}: {err}", path.display()),
    })
}

/// Round number at `pointer`, accepting integers or numeric strings.
fn round_at(state: &EventState, pointer: &str) -> Option<u64> {
    let value = state.pointer(pointer)?;
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_))
}

/// Compare by file name: backends may report canonicalized directories.
fn touches(event: &Event, path: &Path) -> bool {
    is_relevant_event_kind(&event.kind)
        && event
            .paths
            .iter()
            .any(|p| p.file_name().is_some() && p.file_name() == path.file_name())
}

/// Leading-edge debounce with a trailing flush.
#[derive(Debug)]
struct Debounce {
    window: Duration,
    last_sent: Option<Instant>,
    pending: bool,
}

impl Debounce {
    fn new(window: Duration) -> Self {
        Self {
            window,
            last_sent: None,
            pending: false,
        }
    }

    /// Record a write at `now`. Returns `true` when it should notify at once.
    fn hit(&mut self, now: Instant) -> bool {
        match self.last_sent {
            Some(seen) if now.duration_since(seen) < self.window => {
                self.pending = true;
                false
            }
            _ => {
                self.last_sent = Some(now);
                self.pending = false;
                true
            }
        }
    }

    /// When the writes suppressed since the last notification are due.
    fn trailing_deadline(&self) -> Option<Instant> {
        match (self.pending, self.last_sent) {
            (true, Some(seen)) => Some(seen + self.window),
            _ => None,
        }
    }

    fn flush(&mut self, now: Instant) {
        self.last_sent = Some(now);
        self.pending = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind, RemoveKind};
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;
    use tokio::time::advance;

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn debounce_coalesces_rapid_writes() {
        let window = Duration::from_millis(100);
        let mut debounce = Debounce::new(window);
        let mut emitted = 0usize;

        for _ in 0..5 {
            if debounce.hit(Instant::now()) {
                emitted += 1;
            }
            advance(Duration::from_millis(10)).await;
        }
        assert_eq!(emitted, 1, "rapid writes should collapse to one notification");

        advance(Duration::from_millis(150)).await;
        assert!(debounce.hit(Instant::now()));
        assert_eq!(debounce.trailing_deadline(), None);
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn suppressed_write_is_flushed_when_the_window_closes() {
        let window = Duration::from_millis(500);
        let mut debounce = Debounce::new(window);
        let first = Instant::now();

        assert!(debounce.hit(first));
        assert_eq!(debounce.trailing_deadline(), None, "nothing suppressed yet");

        advance(Duration::from_millis(200)).await;
        assert!(!debounce.hit(Instant::now()));
        assert_eq!(debounce.trailing_deadline(), Some(first + window));

        tokio::time::sleep_until(first + window).await;
        debounce.flush(Instant::now());
        assert_eq!(debounce.trailing_deadline(), None);

        advance(Duration::from_millis(100)).await;
        assert!(!debounce.hit(Instant::now()), "flush restarts the window");
    }

    #[test]
    fn only_create_and_modify_of_the_event_file_count() {
        let path = PathBuf::from("/mirror/evt-1.json");
        let hit = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/private/mirror/evt-1.json"));
        let other_file =
            Event::new(EventKind::Create(CreateKind::File)).add_path(PathBuf::from("/mirror/evt-2.json"));
        let removal =
            Event::new(EventKind::Remove(RemoveKind::File)).add_path(PathBuf::from("/mirror/evt-1.json"));

        assert!(touches(&hit, &path));
        assert!(!touches(&other_file, &path));
        assert!(!touches(&removal, &path));
    }

    #[test]
    fn round_pointer_accepts_numbers_and_numeric_strings() {
        assert_eq!(round_at(&json!({"currentRound": {"number": 4}}), DEFAULT_ROUND_POINTER), Some(4));
        assert_eq!(round_at(&json!({"currentRound": {"number": "5"}}), DEFAULT_ROUND_POINTER), Some(5));
        assert_eq!(round_at(&json!({"currentRound": null}), DEFAULT_ROUND_POINTER), None);
    }

    #[tokio::test]
    async fn cache_first_survives_a_broken_file() {
        let dir = TempDir::new().unwrap();
        let source = MirrorSource::new(dir.path());
        let id = EventId::from("evt-1");
        fs::write(source.event_path(&id), r#"{"title": "GP"}"#).unwrap();

        let fresh = source.fetch_event(&id, FetchPolicy::NetworkOnly).await.unwrap();
        assert_eq!(fresh, json!({"title": "GP"}));

        fs::write(source.event_path(&id), "{ truncated").unwrap();
        assert!(source.fetch_event(&id, FetchPolicy::NetworkOnly).await.is_err());
        let cached = source.fetch_event(&id, FetchPolicy::CacheFirst).await.unwrap();
        assert_eq!(cached, json!({"title": "GP"}));
    }

    #[tokio::test]
    async fn burst_of_writes_ends_with_a_notification() {
        let dir = TempDir::new().unwrap();
        let source = MirrorSource::new(dir.path()).with_debounce(Duration::from_millis(200));
        let id = EventId::from("evt-1");
        fs::write(source.event_path(&id), r#"{"v":0}"#).unwrap();
        let mut results = source.subscribe_results(&id).await.unwrap();

        fs::write(source.event_path(&id), r#"{"v":1}"#).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        fs::write(source.event_path(&id), r#"{"v":2}"#).unwrap();

        let leading = tokio::time::timeout(Duration::from_secs(2), results.recv()).await;
        assert!(matches!(leading, Ok(Some(Ok(ResultReported)))));
        let trailing = tokio::time::timeout(Duration::from_secs(2), results.recv()).await;
        assert!(matches!(trailing, Ok(Some(Ok(ResultReported)))), "last write was dropped");
        let latest = source.fetch_event(&id, FetchPolicy::NetworkOnly).await.unwrap();
        assert_eq!(latest, json!({"v": 2}));
    }

    #[tokio::test]
    async fn round_changes_follow_a_custom_pointer() {
        let dir = TempDir::new().unwrap();
        let source = MirrorSource::new(dir.path()).with_round_pointer("/round");
        let id = EventId::from("evt-1");
        fs::write(source.event_path(&id), r#"{"round": 1}"#).unwrap();
        let mut rounds = source.subscribe_rounds(&id).await.unwrap();

        fs::write(source.event_path(&id), r#"{"round": 1, "table": 4}"#).unwrap();
        fs::write(source.event_path(&id), r#"{"round": 2}"#).unwrap();

        let next = tokio::time::timeout(Duration::from_secs(2), rounds.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(next, Round { number: 2 });
    }

    #[tokio::test]
    async fn missing_event_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let source = MirrorSource::new(dir.path());
        let id = EventId::from("ghost");

        let err = source.fetch_event(&id, FetchPolicy::CacheFirst).await.unwrap_err();
        assert!(matches!(err, SourceError::NotFound { .. }));
        let err = source.subscribe_results(&id).await.unwrap_err();
        assert!(matches!(err, SourceError::NotFound { .. }));
    }
}
