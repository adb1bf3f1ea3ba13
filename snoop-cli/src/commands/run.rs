//! `snoop run`: foreground daemon.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;

use snoop_core::paths::default_mirror_dir;
use snoop_daemon::{start_blocking, DaemonOptions};
use snoop_engine::mirror::DEFAULT_ROUND_POINTER;
use snoop_engine::RetryPolicy;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Directory of `<event-id>.json` files kept current by the exporter.
    /// Defaults to `<backup-dir>/.mirror`.
    #[arg(long, env = "SNOOP_MIRROR_DIR", value_name = "DIR")]
    pub mirror_dir: Option<PathBuf>,

    /// JSON pointer of the current round number inside an event file.
    #[arg(long, default_value = DEFAULT_ROUND_POINTER, value_name = "POINTER")]
    pub round_pointer: String,

    /// First re-subscribe delay after a broken notification stream.
    #[arg(long, default_value_t = 1_000, value_name = "MS")]
    pub retry_initial_ms: u64,

    /// Upper bound for the re-subscribe delay.
    #[arg(long, default_value_t = 60_000, value_name = "MS")]
    pub retry_max_ms: u64,
}

impl RunArgs {
    pub fn run(self, root: &Path) -> Result<()> {
        let options = DaemonOptions {
            mirror_dir: self
                .mirror_dir
                .unwrap_or_else(|| default_mirror_dir(root)),
            round_pointer: self.round_pointer,
            retry: RetryPolicy::new(
                Duration::from_millis(self.retry_initial_ms),
                Duration::from_millis(self.retry_max_ms),
            ),
        };
        start_blocking(root, options).context("daemon exited with error")?;
        Ok(())
    }
}
