use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use snoop_core::paths::socket_path;

use crate::error::{io_err, DaemonError};

/// JSON newline-delimited request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonRequest {
    pub cmd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl DaemonRequest {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            ..Self::default()
        }
    }
}

/// JSON newline-delimited response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// `snoop run` may still be binding its socket when a CLI call arrives.
const STATUS_ATTEMPTS: u32 = 5;
const STATUS_RETRY_DELAY: Duration = Duration::from_millis(100);

/// One request/response exchange with the daemon serving the backup root.
///
/// A missing socket, or one nobody is listening on, is reported as
/// [`DaemonError::DaemonNotRunning`] so callers can fall back to editing the
/// watch list directly.
pub fn send_request(root: &Path, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
    let socket = socket_path(root);
    let not_running = || DaemonError::DaemonNotRunning {
        socket: socket.clone(),
    };
    if !socket.exists() {
        return Err(not_running());
    }

    let mut stream = match UnixStream::connect(&socket) {
        Ok(stream) => stream,
        Err(err)
            if matches!(
                err.kind(),
                ErrorKind::NotFound | ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset
            ) =>
        {
            return Err(not_running())
        }
        Err(err) => return Err(io_err(&socket, err)),
    };

    let mut line = serde_json::to_string(request)?;
    line.push('\n');
    stream
        .write_all(line.as_bytes())
        .and_then(|()| stream.flush())
        .map_err(|e| io_err(&socket, e))?;

    let mut reply = String::new();
    let read = BufReader::new(stream)
        .read_line(&mut reply)
        .map_err(|e| io_err(&socket, e))?;
    if read == 0 {
        return Err(DaemonError::Protocol(format!(
            "snoop daemon hung up without answering '{}'",
            request.cmd
        )));
    }
    Ok(serde_json::from_str(reply.trim_end())?)
}

/// Watcher list and daemon metadata. Retries briefly while the socket is
/// coming up.
pub fn request_status(root: &Path) -> Result<Value, DaemonError> {
    let request = DaemonRequest::new("status");
    let mut attempt = 1;
    loop {
        match call(root, &request) {
            Err(DaemonError::DaemonNotRunning { .. }) if attempt < STATUS_ATTEMPTS => {
                attempt += 1;
                sleep(STATUS_RETRY_DELAY);
            }
            outcome => return outcome,
        }
    }
}

pub fn request_stop(root: &Path) -> Result<(), DaemonError> {
    call(root, &DaemonRequest::new("stop")).map(|_| ())
}

pub fn request_add(root: &Path, name: &str, event_id: &str) -> Result<Value, DaemonError> {
    call(
        root,
        &DaemonRequest {
            name: Some(name.to_string()),
            event_id: Some(event_id.to_string()),
            ..DaemonRequest::new("add")
        },
    )
}

pub fn request_remove(root: &Path, name: &str) -> Result<Value, DaemonError> {
    call(
        root,
        &DaemonRequest {
            name: Some(name.to_string()),
            ..DaemonRequest::new("remove")
        },
    )
}

pub fn request_snapshot(root: &Path, name: &str, label: &str) -> Result<Value, DaemonError> {
    call(
        root,
        &DaemonRequest {
            name: Some(name.to_string()),
            label: Some(label.to_string()),
            ..DaemonRequest::new("snapshot")
        },
    )
}

fn call(root: &Path, request: &DaemonRequest) -> Result<Value, DaemonError> {
    send_request(root, request)?.into_data(&request.cmd)
}

impl DaemonResponse {
    /// The `data` of a successful reply; a refusal becomes
    /// [`DaemonError::Protocol`] carrying the daemon's message.
    pub fn into_data(self, cmd: &str) -> Result<Value, DaemonError> {
        match (self.ok, self.error) {
            (true, _) => Ok(self.data.unwrap_or(Value::Null)),
            (false, Some(message)) => Err(DaemonError::Protocol(format!("{cmd}: {message}"))),
            (false, None) => Err(DaemonError::Protocol(format!(
                "{cmd}: refused by snoop daemon without a reason"
            ))),
        }
    }
}
