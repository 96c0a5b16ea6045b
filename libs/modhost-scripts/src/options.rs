use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Supervisor settings, section `scripts` (`MODHOST_SCRIPTS_*`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptsConfig {
    /// Directory worker executables are resolved against.
    pub path: Option<PathBuf>,
}

/// Per-worker policy.
///
/// ```
/// use std::time::Duration;
/// use modhost_scripts::WorkerOptions;
///
/// let options = WorkerOptions::default()
///     .with_args(["ping"])
///     .with_restart_limit(3)
///     .with_uptime_limit(Duration::from_secs(3600));
/// assert!(options.restart);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerOptions {
    /// Restart the process when it exits. Only an explicit `false` disables it.
    pub restart: bool,
    /// Maximum number of restarts; unlimited when absent.
    pub restart_limit: Option<u32>,
    /// Recycle the process once its reported uptime exceeds this.
    #[serde(with = "modhost_utils::duration::option")]
    pub uptime_limit: Option<Duration>,
    #[serde(with = "modhost_utils::duration")]
    pub restart_delay: Duration,
    /// Time between SIGTERM and SIGKILL when stopping or recycling.
    #[serde(with = "modhost_utils::duration")]
    pub stop_grace: Duration,
    /// Default timeout of calls made through the worker handle.
    #[serde(with = "modhost_utils::duration")]
    pub call_timeout: Duration,
    pub args: Vec<String>,
    /// Added on top of the container environment.
    pub env: BTreeMap<String, String>,
    pub working_directory: Option<PathBuf>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            restart: true,
            restart_limit: None,
            uptime_limit: None,
            restart_delay: Duration::ZERO,
            stop_grace: Duration::from_secs(5),
            call_timeout: modhost_ipc::DEFAULT_CALL_TIMEOUT,
            args: Vec::new(),
            env: BTreeMap::new(),
            working_directory: None,
        }
    }
}

impl WorkerOptions {
    #[must_use]
    pub fn with_restart(mut self, restart: bool) -> Self {
        self.restart = restart;
        self
    }

    #[must_use]
    pub fn with_restart_limit(mut self, limit: u32) -> Self {
        self.restart_limit = Some(limit);
        self
    }

    #[must_use]
    pub fn with_uptime_limit(mut self, limit: Duration) -> Self {
        self.uptime_limit = Some(limit);
        self
    }

    #[must_use]
    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    #[must_use]
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}
