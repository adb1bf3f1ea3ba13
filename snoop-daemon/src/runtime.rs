use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, Mutex};

use snoop_core::paths::{default_mirror_dir, runtime_dir, socket_path};
use snoop_core::{EventId, WatcherName};
use snoop_engine::mirror::DEFAULT_ROUND_POINTER;
use snoop_engine::{EventSource, MirrorSource, RetryPolicy, SnapshotKind, WatcherRegistry};

use crate::error::{io_err, DaemonError};
use crate::protocol::{DaemonRequest, DaemonResponse};

pub type SharedRegistry = Arc<Mutex<WatcherRegistry>>;

/// Runtime knobs for [`run`].
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    /// Directory of `<event_id>.json` files read by [`MirrorSource`].
    pub mirror_dir: PathBuf,
    /// JSON pointer of the current round number inside an event file.
    pub round_pointer: String,
    pub retry: RetryPolicy,
}

impl DaemonOptions {
    pub fn for_root(root: &Path) -> Self {
        Self {
            mirror_dir: default_mirror_dir(root),
            round_pointer: DEFAULT_ROUND_POINTER.to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(root: &Path, options: DaemonOptions) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(root.to_path_buf(), options))
}

/// Run the daemon over the file mirror configured in `options`.
pub async fn run(root: PathBuf, options: DaemonOptions) -> Result<(), DaemonError> {
    if !options.mirror_dir.exists() {
        fs::create_dir_all(&options.mirror_dir).map_err(|e| io_err(&options.mirror_dir, e))?;
    }
    let source: Arc<dyn EventSource> =
        Arc::new(MirrorSource::new(&options.mirror_dir).with_round_pointer(options.round_pointer));
    run_with_source(root, source, options.retry).await
}

/// Run the daemon over any [`EventSource`].
///
/// Restores the persisted watch list, serves the control socket, and stops
/// every watcher on ctrl-c or a `stop` request.
pub async fn run_with_source(
    root: PathBuf,
    source: Arc<dyn EventSource>,
    retry: RetryPolicy,
) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&root)?;

    let (registry, failures) = WatcherRegistry::load(&root, source, retry).await?;
    tracing::info!(
        root = %root.display(),
        watchers = registry.watchers().len(),
        failed = failures.len(),
        "snoop daemon started",
    );
    let registry: SharedRegistry = Arc::new(Mutex::new(registry));
    let started_at_unix = unix_seconds_now();

    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let shutdown_rx = shutdown.subscribe();
        let root = root.clone();
        let registry = registry.clone();
        tokio::spawn(async move {
            let result =
                socket_server_task(root, registry, shutdown.clone(), shutdown_rx, started_at_unix)
                    .await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (socket_result, signal_result) = tokio::join!(socket_handle, signal_handle);

    registry.lock().await.stop_all();
    tracing::info!("snoop daemon stopped");

    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

async fn socket_server_task(
    root: PathBuf,
    registry: SharedRegistry,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
    started_at_unix: u64,
) -> Result<(), DaemonError> {
    let socket = socket_path(&root);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::debug!(socket = %socket.display(), "control socket listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let root = root.clone();
                let registry = registry.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) =
                        handle_socket_client(stream, root, registry, shutdown_tx, started_at_unix).await
                    {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    root: PathBuf,
    registry: SharedRegistry,
    shutdown_tx: broadcast::Sender<()>,
    started_at_unix: u64,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let response =
            handle_request(&request, &root, &registry, &shutdown_tx, started_at_unix).await;
        write_response(&mut writer, &response).await?;
        if request.cmd == "stop" {
            break;
        }
    }

    Ok(())
}

async fn handle_request(
    request: &DaemonRequest,
    root: &Path,
    registry: &SharedRegistry,
    shutdown_tx: &broadcast::Sender<()>,
    started_at_unix: u64,
) -> DaemonResponse {
    match request.cmd.as_str() {
        "status" => DaemonResponse::ok(build_status_payload(root, registry, started_at_unix).await),
        "add" => {
            let (Some(name), Some(event_id)) = (&request.name, &request.event_id) else {
                return DaemonResponse::error("'add' requires 'name' and 'event_id'");
            };
            let name = WatcherName::from(name.as_str());
            // The first snapshot runs without the lock; commit re-checks the name.
            let prepared = registry.lock().await.prepare(name, EventId::from(event_id.as_str()));
            let pending = match prepared {
                Ok(pending) => pending,
                Err(err) => return DaemonResponse::error(err.to_string()),
            };
            let descriptor = pending.descriptor().clone();
            let committed = match pending.start().await {
                Ok(watcher) => registry.lock().await.commit(watcher).await,
                Err(err) => Err(err),
            };
            match committed {
                Ok(rolling) => DaemonResponse::ok(json!({
                    "name": descriptor.name,
                    "event_id": descriptor.event_id,
                    "rolling": rolling.display().to_string(),
                })),
                Err(err) => DaemonResponse::error(err.to_string()),
            }
        }
        "remove" => {
            let Some(name) = &request.name else {
                return DaemonResponse::error("'remove' requires 'name'");
            };
            let mut registry = registry.lock().await;
            match registry.remove(&WatcherName::from(name.as_str())).await {
                Ok(watcher) => DaemonResponse::ok(json!({
                    "name": watcher.name(),
                    "event_id": watcher.event_id(),
                    "dir": watcher.dir().display().to_string(),
                })),
                Err(err) => DaemonResponse::error(err.to_string()),
            }
        }
        "snapshot" => {
            let (Some(name), Some(label)) = (&request.name, &request.label) else {
                return DaemonResponse::error("'snapshot' requires 'name' and 'label'");
            };
            let found = registry.lock().await.watcher(&WatcherName::from(name.as_str()));
            let watcher = match found {
                Ok(watcher) => watcher,
                Err(err) => return DaemonResponse::error(err.to_string()),
            };
            match watcher.take_snapshot(label, SnapshotKind::Archival).await {
                Ok(snapshot) => DaemonResponse::ok(json!(snapshot)),
                Err(err) => DaemonResponse::error(err.to_string()),
            }
        }
        "stop" => {
            let _ = shutdown_tx.send(());
            DaemonResponse::ok(json!({ "stopping": true }))
        }
        other => DaemonResponse::error(format!("unknown command '{other}'")),
    }
}

async fn build_status_payload(root: &Path, registry: &SharedRegistry, started_at_unix: u64) -> Value {
    let watchers: Vec<Value> = {
        let registry = registry.lock().await;
        registry
            .watchers()
            .iter()
            .map(|watcher| {
                json!({
                    "name": watcher.name(),
                    "event_id": watcher.event_id(),
                    "rolling": watcher.rolling_path().display().to_string(),
                    "subscribed": watcher.subscription_count() > 0,
                })
            })
            .collect()
    };

    json!({
        "running": true,
        "started_at_unix": started_at_unix,
        "backup_root": root.display().to_string(),
        "socket": socket_path(root).display().to_string(),
        "watchers": watchers,
    })
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(root: &Path) -> Result<(), DaemonError> {
    let run = runtime_dir(root);
    if !run.exists() {
        fs::create_dir_all(&run).map_err(|e| io_err(&run, e))?;
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
