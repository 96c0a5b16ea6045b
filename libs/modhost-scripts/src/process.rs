//! Child process plumbing: spawn, terminate, and exit decoding.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use modhost::Environment;
use tokio::process::{Child, Command};

use crate::error::ScriptsError;
use crate::options::WorkerOptions;
use crate::worker::WorkerExit;

/// Worker identity handed to the child; its `ChildProcess` module attaches
/// to the parent channel when this is set.
pub(crate) const WORKER_NAME_VAR: &str = "MODHOST_WORKER_NAME";
const CONTAINER_NAME_VAR: &str = "MODHOST_NAME";

/// Spawns `path` with a clean environment built from `environment`, the
/// worker's overrides, and its identity. stdio is piped: stdin/stdout carry
/// the channel, stderr is forwarded to the parent's logs.
pub(crate) fn spawn(
    name: &str,
    path: &Path,
    environment: &Environment,
    options: &WorkerOptions,
) -> Result<Child, ScriptsError> {
    let env = environment
        .copy(options.env.iter().map(|(k, v)| (k.clone(), v.clone())))
        .copy([(WORKER_NAME_VAR, name), (CONTAINER_NAME_VAR, name)]);

    let mut cmd = Command::new(path);
    cmd.args(&options.args)
        .env_clear()
        .envs(env.iter())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(dir) = &options.working_directory {
        if dir.is_dir() {
            cmd.current_dir(dir);
        } else {
            tracing::warn!(
                worker = %name,
                working_dir = %dir.display(),
                "Working directory does not exist or is not a directory, using current dir"
            );
        }
    }

    cmd.spawn().map_err(|source| ScriptsError::Spawn {
        name: name.to_owned(),
        path: path.to_owned(),
        source,
    })
}

/// Sends SIGTERM. Returns `false` when the process is gone or the platform
/// has no graceful termination.
#[cfg(unix)]
pub(crate) fn send_terminate_signal(child: &Child) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return false;
    };
    let Ok(pid) = i32::try_from(pid) else {
        tracing::warn!(pid, "PID exceeds i32::MAX, cannot send SIGTERM");
        return false;
    };
    kill(Pid::from_raw(pid), Signal::SIGTERM).is_ok()
}

#[cfg(windows)]
pub(crate) fn send_terminate_signal(_child: &Child) -> bool {
    false
}

/// SIGTERM, then SIGKILL once `grace` expires.
pub(crate) async fn stop_child_with_grace(worker: &str, child: &mut Child, grace: Duration) -> WorkerExit {
    let pid = child.id();
    let graceful = send_terminate_signal(child);
    tracing::debug!(worker, pid, graceful, "Sent termination signal");

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => WorkerExit::from_wait(status),
        Err(_) => {
            tracing::warn!(worker, pid, ?grace, "Grace period expired, force killing");
            if let Err(err) = child.kill().await {
                tracing::warn!(worker, error = %err, "Failed to force kill");
            }
            WorkerExit::from_wait(child.wait().await)
        }
    }
}

#[cfg(unix)]
pub(crate) fn signal_name(status: ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;

    let signal = status.signal()?;
    Some(match nix::sys::signal::Signal::try_from(signal) {
        Ok(signal) => signal.as_str().to_owned(),
        Err(_) => format!("SIG{signal}"),
    })
}

#[cfg(windows)]
pub(crate) fn signal_name(_status: ExitStatus) -> Option<String> {
    None
}

#[cfg(all(test, unix))]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn sh(script: &str) -> (std::path::PathBuf, WorkerOptions) {
        (
            "/bin/sh".into(),
            WorkerOptions::default().with_args(["-c", script]),
        )
    }

    fn path_only() -> Environment {
        Environment::from_pairs([("PATH", "/usr/bin:/bin")])
    }

    #[tokio::test]
    async fn child_sees_identity_and_overrides_only() {
        let (path, options) = sh(
            "test \"$MODHOST_WORKER_NAME\" = w1 && test \"$EXTRA\" = yes && test -z \"$HOME\"",
        );
        let env = path_only();
        let options = options.with_env("EXTRA", "yes");
        let mut child = spawn("w1", &path, &env, &options).unwrap();
        let exit = WorkerExit::from_wait(child.wait().await);
        assert_eq!(exit.code, Some(0));
    }

    #[tokio::test]
    async fn missing_executable_is_a_spawn_error() {
        let err = spawn(
            "w1",
            Path::new("/nonexistent/worker"),
            &Environment::new(),
            &WorkerOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err.as_label(), "spawn_failed");
    }

    #[tokio::test]
    async fn cooperative_child_exits_on_sigterm() {
        let (path, options) = sh("trap 'exit 0' TERM; while :; do sleep 0.05; done");
        let mut child = spawn("w1", &path, &path_only(), &options).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let exit = stop_child_with_grace("w1", &mut child, Duration::from_secs(5)).await;
        assert_eq!(exit.code, Some(0));
    }

    #[tokio::test]
    async fn stubborn_child_is_killed() {
        let (path, options) = sh("trap '' TERM; while :; do sleep 0.05; done");
        let mut child = spawn("w1", &path, &path_only(), &options).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let exit = stop_child_with_grace("w1", &mut child, Duration::from_millis(300)).await;
        assert_eq!(exit.signal.as_deref(), Some("SIGKILL"));
        assert_eq!(exit.code, None);
    }
}
