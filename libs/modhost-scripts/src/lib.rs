#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![forbid(unsafe_code)]

//! Worker supervision for `ModHost`.
//!
//! [`Scripts`] is a module that runs named workers as child processes. Each
//! worker is a slot that outlives its processes: on exit the process is
//! restarted according to [`WorkerOptions`], and a worker whose reported
//! uptime passes `uptime_limit` is recycled. The [`Worker`] handle forwards
//! calls and events over the current process's channel.

pub mod error;
pub mod options;
pub mod supervisor;
pub mod worker;

mod log_forwarder;
mod process;

pub use error::ScriptsError;
pub use options::{ScriptsConfig, WorkerOptions};
pub use supervisor::Scripts;
pub use worker::{Worker, WorkerExit, WorkerState, WorkerStatus};
