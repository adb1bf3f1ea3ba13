pub mod daemon;
pub mod run;
pub mod snapshot;
pub mod watch;
