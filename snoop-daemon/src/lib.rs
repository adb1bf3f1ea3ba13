//! Snoop daemon runtime: watcher registry + control socket server.

mod error;
pub mod protocol;
mod runtime;

pub use error::DaemonError;
pub use protocol::{
    request_add, request_remove, request_snapshot, request_status, request_stop, send_request,
    DaemonRequest, DaemonResponse,
};
pub use runtime::{run, run_with_source, start_blocking, DaemonOptions, SharedRegistry};
