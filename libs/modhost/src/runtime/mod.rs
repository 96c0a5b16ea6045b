//! Host runner: build, up, wait for shutdown, down, destroy.

pub mod runner;
pub mod shutdown;

pub use runner::{RunOptions, ShutdownOptions, run};
pub use shutdown::{ShutdownSignal, ShutdownSignals, wait_for_shutdown};
