use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::task::JoinSet;

use snoop_core::{EventId, WatcherName};
use snoop_engine::snapshot::RollingStatus;
use snoop_engine::{
    MemorySource, MirrorSource, RetryPolicy, SnapshotKind, WatchError, Watcher, DEGRADED_MARKER,
};

const EVENT: &str = "evt-chicago";

struct Fixture {
    root: TempDir,
    source: Arc<MemorySource>,
    watcher: Watcher,
}

impl Fixture {
    fn new() -> Self {
        let root = TempDir::new().expect("root");
        let source = Arc::new(MemorySource::new());
        source.insert_event(event(), json!({"title": "GP Chicago", "round": 1}));
        let watcher = Watcher::with_retry(
            event(),
            WatcherName::from("GP-Chicago"),
            root.path(),
            source.clone(),
            RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(40)),
        )
        .expect("watcher");
        Self {
            root,
            source,
            watcher,
        }
    }

    fn watcher_dir(&self) -> PathBuf {
        self.root.path().join("GP-Chicago")
    }

    fn archived(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(self.watcher_dir().join("snapshots"))
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    fn rolling(&self) -> Option<Value> {
        read_json(&self.watcher_dir().join("rolling.json"))
    }

    fn rolling_status(&self) -> Option<RollingStatus> {
        let body = fs::read_to_string(self.watcher_dir().join("rolling.status.json")).ok()?;
        serde_json::from_str(&body).ok()
    }
}

fn event() -> EventId {
    EventId::from(EVENT)
}

fn read_json(path: &Path) -> Option<Value> {
    let body = fs::read_to_string(path).ok()?;
    serde_json::from_str(&body).ok()
}

async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn start_creates_namespace_and_rolling_snapshot() {
    let fx = Fixture::new();

    let rolling = fx.watcher.start().await.expect("start");

    assert_eq!(rolling, fx.root.path().join("GP-Chicago").join("rolling.json"));
    assert!(fx.watcher_dir().join("snapshots").is_dir());
    assert_eq!(fx.rolling(), Some(json!({"title": "GP Chicago", "round": 1})));
    assert_eq!(fx.watcher.subscription_count(), 2);
    assert_eq!(fx.source.live_subscriptions(&event()), 2);

    let status = fx.rolling_status().expect("status sidecar");
    assert_eq!(status.label, "rolling");
    assert!(!status.degraded);
}

#[tokio::test]
async fn rolling_snapshot_is_two_space_indented_json() {
    let fx = Fixture::new();
    fx.watcher.start().await.expect("start");

    let body = fs::read_to_string(fx.watcher_dir().join("rolling.json")).expect("read rolling");
    assert!(body.starts_with("{\n  \""), "unexpected layout: {body}");
}

#[tokio::test]
async fn round_change_archives_auto_snapshot() {
    let fx = Fixture::new();
    fx.watcher.start().await.expect("start");
    fx.source.insert_event(event(), json!({"round": 3}));

    assert_eq!(fx.source.push_round(&event(), 3), 1);

    assert!(wait_for(|| !fx.archived().is_empty()).await, "no archival snapshot");
    let archived = fx.archived();
    assert_eq!(archived.len(), 1);
    assert!(archived[0].ends_with(".round-3-auto.json"), "got {archived:?}");
    let content = read_json(&fx.watcher_dir().join("snapshots").join(&archived[0]));
    assert_eq!(content, Some(json!({"round": 3})));
}

#[tokio::test]
async fn result_refreshes_rolling_snapshot() {
    let fx = Fixture::new();
    fx.watcher.start().await.expect("start");
    fx.source.insert_event(event(), json!({"round": 1, "results": 4}));

    assert_eq!(fx.source.push_result(&event()), 1);

    assert!(
        wait_for(|| fx.rolling() == Some(json!({"round": 1, "results": 4}))).await,
        "rolling snapshot not refreshed"
    );
    assert!(fx.archived().is_empty(), "results never archive");
}

#[tokio::test]
async fn network_outage_writes_cached_state_with_degraded_label() {
    let fx = Fixture::new();
    fx.watcher.start().await.expect("start");
    fx.source.insert_event(event(), json!({"round": 2}));
    fx.source.set_network_available(false);

    fx.source.push_result(&event());

    assert!(
        wait_for(|| fx.rolling_status().is_some_and(|s| s.degraded)).await,
        "degraded status never recorded"
    );
    let status = fx.rolling_status().expect("status");
    assert_eq!(status.label, format!("rolling{DEGRADED_MARKER}"));
    assert_eq!(
        fx.rolling(),
        Some(json!({"title": "GP Chicago", "round": 1})),
        "cached copy, not the unreachable remote state"
    );
    assert!(fx.watcher_dir().join("rolling.json").is_file());
}

#[tokio::test]
async fn degraded_archival_snapshot_carries_marker_in_file_name() {
    let fx = Fixture::new();
    fx.watcher.start().await.expect("start");
    fx.source.set_network_available(false);

    let snapshot = fx
        .watcher
        .take_snapshot("finals", SnapshotKind::Archival)
        .await
        .expect("snapshot");

    assert!(snapshot.degraded);
    assert_eq!(snapshot.label, "finals.FROM-CACHE-ONLY");
    let file_name = snapshot.path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(file_name.ends_with(".finals.FROM-CACHE-ONLY.json"), "got {file_name}");
}

#[tokio::test]
async fn fresh_network_read_is_used_verbatim() {
    let fx = Fixture::new();
    fx.watcher.start().await.expect("start");
    fx.source.insert_event(event(), json!({"round": 5, "standings": [1, 2, 3]}));

    let snapshot = fx
        .watcher
        .take_snapshot("manual", SnapshotKind::Archival)
        .await
        .expect("snapshot");

    assert!(!snapshot.degraded);
    assert_eq!(snapshot.label, "manual");
    assert_eq!(
        read_json(&snapshot.path),
        Some(json!({"round": 5, "standings": [1, 2, 3]}))
    );
}

#[tokio::test]
async fn snapshot_fails_without_cache_or_network() {
    let fx = Fixture::new();
    fx.source.set_network_available(false);

    let err = fx
        .watcher
        .take_snapshot("manual", SnapshotKind::Archival)
        .await
        .unwrap_err();

    assert!(matches!(err, WatchError::Fetch(_)), "got: {err}");
    assert!(fx.archived().is_empty());
}

#[tokio::test]
async fn archival_snapshots_at_distinct_seconds_coexist() {
    let fx = Fixture::new();
    fx.watcher.start().await.expect("start");
    let first = Utc.with_ymd_and_hms(2024, 5, 4, 13, 7, 9).unwrap();
    let second = Utc.with_ymd_and_hms(2024, 5, 4, 13, 7, 10).unwrap();

    fx.watcher
        .take_snapshot_at("top8", SnapshotKind::Archival, first)
        .await
        .expect("first");
    fx.watcher
        .take_snapshot_at("top8", SnapshotKind::Archival, second)
        .await
        .expect("second");

    assert_eq!(
        fx.archived(),
        vec![
            "2024-05-04_13-07-09.top8.json".to_string(),
            "2024-05-04_13-07-10.top8.json".to_string(),
        ]
    );
}

#[tokio::test]
async fn rolling_snapshot_is_overwritten_in_place() {
    let fx = Fixture::new();
    fx.watcher.start().await.expect("start");
    fx.source.insert_event(event(), json!({"round": 7}));

    fx.watcher
        .take_snapshot("rolling", SnapshotKind::Rolling)
        .await
        .expect("rolling");

    assert_eq!(fx.rolling(), Some(json!({"round": 7})));
    let names: Vec<_> = fs::read_dir(fx.watcher_dir())
        .unwrap()
        .filter_map(Result::ok)
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".tmp"))
        .collect();
    assert!(names.is_empty(), "temp files left behind: {names:?}");
}

#[tokio::test]
async fn invalid_label_is_rejected_before_writing() {
    let fx = Fixture::new();
    fx.watcher.start().await.expect("start");

    let err = fx
        .watcher
        .take_snapshot("../outside", SnapshotKind::Archival)
        .await
        .unwrap_err();

    assert!(matches!(err, WatchError::Config(_)), "got: {err}");
    assert!(fx.archived().is_empty());
}

#[tokio::test]
async fn resubscribe_replaces_the_pair() {
    let fx = Fixture::new();
    fx.watcher.start().await.expect("start");

    for _ in 0..3 {
        let path = fx.watcher.resubscribe().await.expect("resubscribe");
        assert_eq!(path, fx.watcher.rolling_path());
        assert_eq!(fx.watcher.subscription_count(), 2);
        assert_eq!(fx.source.live_subscriptions(&event()), 2);
    }

    fx.source.insert_event(event(), json!({"round": 4}));
    fx.source.push_round(&event(), 4);
    assert!(wait_for(|| fx.archived().len() == 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fx.archived().len(), 1, "one notification, one snapshot");
}

#[tokio::test]
async fn stop_silences_notifications() {
    let fx = Fixture::new();
    fx.watcher.start().await.expect("start");

    fx.watcher.stop();
    assert_eq!(fx.watcher.subscription_count(), 0);
    assert!(fx.watcher.is_stopped());

    fx.source.insert_event(event(), json!({"round": 9}));
    fx.source.push_result(&event());
    fx.source.push_round(&event(), 9);
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(fx.rolling(), Some(json!({"title": "GP Chicago", "round": 1})));
    assert!(fx.archived().is_empty());
    assert!(wait_for(|| fx.source.live_subscriptions(&event()) == 0).await);
}

#[tokio::test]
async fn stop_is_idempotent_and_final() {
    let fx = Fixture::new();
    fx.watcher.start().await.expect("start");

    fx.watcher.stop();
    fx.watcher.stop();

    let err = fx.watcher.resubscribe().await.unwrap_err();
    assert!(matches!(err, WatchError::Stopped { .. }), "got: {err}");
    assert_eq!(fx.watcher.subscription_count(), 0);
}

#[tokio::test]
async fn broken_stream_rearms_after_backoff() {
    let fx = Fixture::new();
    fx.watcher.start().await.expect("start");
    fx.source.insert_event(event(), json!({"round": 2, "recovered": true}));

    fx.source.fail_streams(&event(), "connection reset");

    assert!(
        wait_for(|| fx.rolling() == Some(json!({"round": 2, "recovered": true}))).await,
        "no rolling snapshot after re-arm"
    );
    assert!(wait_for(|| fx.watcher.subscription_count() == 2).await);
    assert_eq!(fx.source.live_subscriptions(&event()), 2);

    fx.source.insert_event(event(), json!({"round": 3}));
    assert_eq!(fx.source.push_round(&event(), 3), 1, "fresh pair receives notifications");
    assert!(wait_for(|| fx.archived().len() == 1).await);
}

#[tokio::test]
async fn rearm_retries_until_subscribe_succeeds() {
    let fx = Fixture::new();
    fx.watcher.start().await.expect("start");
    fx.source.set_subscribe_failure(Some("service restarting"));

    fx.source.fail_streams(&event(), "connection reset");
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(fx.watcher.subscription_count(), 0);
    assert_eq!(fx.source.live_subscriptions(&event()), 0);

    fx.source.set_subscribe_failure(None);
    assert!(
        wait_for(|| fx.watcher.subscription_count() == 2).await,
        "watcher never re-armed"
    );
    assert!(wait_for(|| fx.source.live_subscriptions(&event()) == 2).await);
}

#[tokio::test]
async fn stop_cancels_pending_recovery() {
    let root = TempDir::new().expect("root");
    let source = Arc::new(MemorySource::new());
    source.insert_event(event(), json!({}));
    let watcher = Watcher::with_retry(
        event(),
        WatcherName::from("slow"),
        root.path(),
        source.clone(),
        RetryPolicy::new(Duration::from_millis(200), Duration::from_millis(200)),
    )
    .expect("watcher");
    watcher.start().await.expect("start");

    source.fail_streams(&event(), "gone");
    tokio::time::sleep(Duration::from_millis(30)).await;
    watcher.stop();
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(watcher.subscription_count(), 0);
    assert_eq!(source.live_subscriptions(&event()), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_rolling_writes_leave_a_complete_file() {
    let fx = Fixture::new();
    fx.watcher.start().await.expect("start");
    let big = json!({"players": (0..500).map(|i| format!("player-{i}")).collect::<Vec<_>>()});
    fx.source.insert_event(event(), big.clone());

    let mut set = JoinSet::new();
    for _ in 0..16 {
        let watcher = fx.watcher.clone();
        set.spawn(async move { watcher.take_snapshot("rolling", SnapshotKind::Rolling).await });
    }
    while let Some(joined) = set.join_next().await {
        joined.expect("join").expect("snapshot");
    }

    assert_eq!(fx.rolling(), Some(big));
}

#[tokio::test]
async fn start_fails_when_namespace_is_blocked_by_a_file() {
    let fx = Fixture::new();
    fs::write(fx.watcher_dir(), "not a directory").expect("blocker");

    let err = fx.watcher.start().await.unwrap_err();

    assert!(matches!(err, WatchError::Io { .. }), "got: {err}");
    assert_eq!(fx.watcher.subscription_count(), 0);
}

#[tokio::test]
async fn start_fails_for_unknown_event() {
    let root = TempDir::new().expect("root");
    let source = Arc::new(MemorySource::new());
    let watcher = Watcher::new(
        EventId::from("missing"),
        WatcherName::from("ghost"),
        root.path(),
        source,
    )
    .expect("watcher");

    let err = watcher.start().await.unwrap_err();
    assert!(matches!(err, WatchError::Subscribe { .. }), "got: {err}");
}

#[tokio::test]
async fn rolling_snapshot_catches_the_last_write_of_a_mirror_burst() {
    let root = TempDir::new().expect("root");
    let mirror = TempDir::new().expect("mirror");
    let source = Arc::new(MirrorSource::new(mirror.path()).with_debounce(Duration::from_millis(200)));
    let mirror_file = source.event_path(&event());
    fs::write(&mirror_file, r#"{"v":0}"#).expect("seed mirror");
    let watcher = Watcher::with_retry(
        event(),
        WatcherName::from("GP-Chicago"),
        root.path(),
        source,
        RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(40)),
    )
    .expect("watcher");
    watcher.start().await.expect("start");
    let rolling = watcher.rolling_path();

    fs::write(&mirror_file, r#"{"v":1}"#).expect("first write");
    tokio::time::sleep(Duration::from_millis(80)).await;
    fs::write(&mirror_file, r#"{"v":2}"#).expect("second write");

    assert!(
        wait_for(|| read_json(&rolling) == Some(json!({"v": 2}))).await,
        "rolling stuck at {:?}",
        read_json(&rolling)
    );
    watcher.stop();
}
