//! Live watch list: reconstruction from the descriptor file and full-set
//! rewrites after every change.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinSet;

use snoop_core::{config, Descriptor, EventId, WatcherName};

use crate::error::WatchError;
use crate::retry::RetryPolicy;
use crate::snapshot::{Snapshot, SnapshotKind};
use crate::source::EventSource;
use crate::watcher::Watcher;

/// A descriptor that could not be turned into a running watcher.
#[derive(Debug)]
pub struct LoadFailure {
    pub descriptor: Descriptor,
    pub error: WatchError,
}

/// Outcome of [`load_all`]: started watchers in descriptor order, plus the
/// descriptors that failed.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub watchers: Vec<Watcher>,
    pub failures: Vec<LoadFailure>,
}

// ---------------------------------------------------------------------------
// 1. Load / save
// ---------------------------------------------------------------------------

/// Rebuild and start every watcher persisted under `root`.
///
/// Each descriptor is reconstructed independently; a failure is logged and
/// reported without affecting the others. A malformed descriptor file is a
/// hard error.
pub async fn load_all(
    root: &Path,
    source: Arc<dyn EventSource>,
    retry: RetryPolicy,
) -> Result<LoadReport, WatchError> {
    let config = {
        let root = root.to_path_buf();
        tokio::task::spawn_blocking(move || config::load_at(&root))
            .await
            .map_err(|err| WatchError::Task(format!("watch list load join error: {err}")))??
    };

    let mut set = JoinSet::new();
    for (index, descriptor) in config.snoops.into_iter().enumerate() {
        let source = source.clone();
        let root = root.to_path_buf();
        set.spawn(async move {
            let result = start_watcher(&descriptor, &root, source, retry).await;
            (index, descriptor, result)
        });
    }

    let mut settled = Vec::new();
    while let Some(joined) = set.join_next().await {
        let outcome =
            joined.map_err(|err| WatchError::Task(format!("watcher start join error: {err}")))?;
        settled.push(outcome);
    }
    settled.sort_by_key(|(index, _, _)| *index);

    let mut report = LoadReport::default();
    for (_, descriptor, result) in settled {
        match result {
            Ok(watcher) => report.watchers.push(watcher),
            Err(error) => {
                tracing::warn!(
                    watcher = %descriptor.name,
                    event = %descriptor.event_id,
                    error = %error,
                    "watcher could not be restarted",
                );
                report.failures.push(LoadFailure { descriptor, error });
            }
        }
    }
    Ok(report)
}

/// Overwrite the descriptor file with exactly `watchers`, in order.
pub async fn save_all(root: &Path, watchers: &[Watcher]) -> Result<(), WatchError> {
    persist(root, watchers.iter().map(Watcher::descriptor).collect()).await
}

async fn persist(root: &Path, descriptors: Vec<Descriptor>) -> Result<(), WatchError> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || config::save_descriptors_at(&root, &descriptors))
        .await
        .map_err(|err| WatchError::Task(format!("watch list save join error: {err}")))??;
    Ok(())
}

async fn start_watcher(
    descriptor: &Descriptor,
    root: &Path,
    source: Arc<dyn EventSource>,
    retry: RetryPolicy,
) -> Result<Watcher, WatchError> {
    let watcher = Watcher::with_retry(
        descriptor.event_id.clone(),
        descriptor.name.clone(),
        root,
        source,
        retry,
    )?;
    if let Err(err) = watcher.start().await {
        watcher.stop();
        return Err(err);
    }
    Ok(watcher)
}

// ---------------------------------------------------------------------------
// 2. Registry
// ---------------------------------------------------------------------------

/// Ordered set of running watchers sharing one backup root and source.
pub struct WatcherRegistry {
    root: PathBuf,
    source: Arc<dyn EventSource>,
    retry: RetryPolicy,
    watchers: Vec<Watcher>,
}

impl std::fmt::Debug for WatcherRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherRegistry")
            .field("root", &self.root)
            .field("retry", &self.retry)
            .field("watchers", &self.watchers)
            .finish()
    }
}

impl WatcherRegistry {
    pub fn new(root: impl Into<PathBuf>, source: Arc<dyn EventSource>, retry: RetryPolicy) -> Self {
        Self {
            root: root.into(),
            source,
            retry,
            watchers: Vec::new(),
        }
    }

    /// [`load_all`] into a registry. Failures are returned alongside.
    pub async fn load(
        root: impl Into<PathBuf>,
        source: Arc<dyn EventSource>,
        retry: RetryPolicy,
    ) -> Result<(Self, Vec<LoadFailure>), WatchError> {
        let mut registry = Self::new(root, source, retry);
        let report = load_all(&registry.root, registry.source.clone(), retry).await?;
        registry.watchers = report.watchers;
        Ok((registry, report.failures))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn watchers(&self) -> &[Watcher] {
        &self.watchers
    }

    pub fn get(&self, name: &WatcherName) -> Option<&Watcher> {
        self.watchers.iter().find(|w| w.name() == name)
    }

    pub fn descriptors(&self) -> Vec<Descriptor> {
        self.watchers.iter().map(Watcher::descriptor).collect()
    }

    /// Start watching `event_id` as `name`, then persist the watch list.
    /// Returns the rolling snapshot path produced while starting.
    pub async fn add(&mut self, name: WatcherName, event_id: EventId) -> Result<PathBuf, WatchError> {
        let watcher = self.prepare(name, event_id)?.start().await?;
        self.commit(watcher).await
    }

    /// Validate a new watcher without starting it. The returned handle owns
    /// everything needed to start, so the registry need not stay borrowed
    /// while the first snapshot is fetched.
    pub fn prepare(&self, name: WatcherName, event_id: EventId) -> Result<PendingWatcher, WatchError> {
        name.validate()?;
        self.ensure_unused(&name)?;
        Ok(PendingWatcher {
            descriptor: Descriptor { name, event_id },
            root: self.root.clone(),
            source: self.source.clone(),
            retry: self.retry,
        })
    }

    /// Persist the watch list including `watcher`, then adopt it.
    ///
    /// The watcher joins the live set only once the watch list naming it has
    /// been written. On any failure it is stopped again.
    pub async fn commit(&mut self, watcher: Watcher) -> Result<PathBuf, WatchError> {
        let descriptor = watcher.descriptor();
        let mut descriptors = self.descriptors();
        descriptors.push(descriptor.clone());
        let persisted = match self.ensure_unused(&descriptor.name) {
            Ok(()) => persist(&self.root, descriptors).await,
            Err(err) => Err(err),
        };
        if let Err(err) = persisted {
            watcher.stop();
            tracing::warn!(
                watcher = %descriptor.name,
                error = %err,
                "watcher discarded",
            );
            return Err(err);
        }

        let rolling = watcher.rolling_path();
        self.watchers.push(watcher);
        tracing::info!(watcher = %descriptor.name, event = %descriptor.event_id, "watcher added");
        Ok(rolling)
    }

    /// Persist the watch list without `name`, then stop it. Files are kept.
    pub async fn remove(&mut self, name: &WatcherName) -> Result<Watcher, WatchError> {
        let index = self
            .watchers
            .iter()
            .position(|w| w.name() == name)
            .ok_or_else(|| WatchError::UnknownWatcher {
                name: name.0.clone(),
            })?;
        let mut descriptors = self.descriptors();
        descriptors.remove(index);
        persist(&self.root, descriptors).await?;

        let watcher = self.watchers.remove(index);
        watcher.stop();
        tracing::info!(watcher = %name, "watcher removed; snapshots kept on disk");
        Ok(watcher)
    }

    /// Handle on `name`, detached from the registry borrow.
    pub fn watcher(&self, name: &WatcherName) -> Result<Watcher, WatchError> {
        self.get(name)
            .cloned()
            .ok_or_else(|| WatchError::UnknownWatcher {
                name: name.0.clone(),
            })
    }

    /// Manual archival snapshot of `name`.
    pub async fn snapshot(&self, name: &WatcherName, label: &str) -> Result<Snapshot, WatchError> {
        self.watcher(name)?
            .take_snapshot(label, SnapshotKind::Archival)
            .await
    }

    /// Stop every watcher. The persisted watch list is left as-is so the next
    /// start picks the same events up again.
    pub fn stop_all(&self) {
        for watcher in &self.watchers {
            watcher.stop();
        }
    }

    fn ensure_unused(&self, name: &WatcherName) -> Result<(), WatchError> {
        if self.get(name).is_some() {
            return Err(snoop_core::ConfigError::DuplicateName {
                name: name.0.clone(),
            }
            .into());
        }
        Ok(())
    }
}

/// A validated watcher that has not been started. See [`WatcherRegistry::prepare`].
pub struct PendingWatcher {
    descriptor: Descriptor,
    root: PathBuf,
    source: Arc<dyn EventSource>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for PendingWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingWatcher")
            .field("descriptor", &self.descriptor)
            .field("root", &self.root)
            .finish()
    }
}

impl PendingWatcher {
    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    /// Start the watcher (subscriptions plus the first rolling snapshot).
    /// A watcher that fails to start is stopped before the error is returned.
    pub async fn start(self) -> Result<Watcher, WatchError> {
        start_watcher(&self.descriptor, &self.root, self.source, self.retry).await
    }
}
