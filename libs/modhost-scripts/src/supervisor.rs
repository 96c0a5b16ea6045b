//! The `scripts` module: named worker slots and their supervision loops.
//!
//! Each slot runs one task that owns the current child process. The task
//! attaches a channel to the child's stdio, pumps its events into the slot,
//! watches the `process.status` heartbeat for the uptime limit, and on exit
//! decides between restart and stop. Stopping is a cancellation of the slot
//! token; the task then terminates the process and returns its exit.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::future::join_all;
use futures::stream::BoxStream;
use modhost::{
    Bus, ContainerHandle, Environment, LogRecord, MetricRecord, Module, ModuleCtx, ModuleFactory,
    ModuleLog, ModuleMetric, Resolved,
};
use modhost_ipc::{Channel, ChannelBuilder, ProcessStatus, STATUS_EVENT};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::ScriptsError;
use crate::log_forwarder::spawn_stderr_forwarder;
use crate::options::{ScriptsConfig, WorkerOptions};
use crate::process;
use crate::worker::{Worker, WorkerExit, WorkerState};

/// How long stderr may keep draining after the process exited.
const FORWARDER_DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

struct Slot {
    worker: Worker,
    task: JoinHandle<WorkerExit>,
}

/// Supervises worker processes.
///
/// Requires `MODHOST_SCRIPTS_PATH`, the directory worker executables are
/// resolved against. Inbound calls from workers are served by this
/// container's callable modules, and their log/metric records are
/// re-published on its buses.
pub struct Scripts {
    ctx: ModuleCtx,
    config: ScriptsConfig,
    slots: Mutex<HashMap<String, Slot>>,
    cancel: CancellationToken,
}

#[async_trait]
impl Module for Scripts {
    /// Stops every worker concurrently.
    async fn down(&self) -> anyhow::Result<()> {
        let slots: Vec<Slot> = self.slots.lock().drain().map(|(_, slot)| slot).collect();
        if slots.is_empty() {
            return Ok(());
        }
        tracing::info!(count = slots.len(), "Stopping workers");
        for slot in &slots {
            slot.worker.inner.cancel.cancel();
        }
        let stopped = join_all(slots.into_iter().map(|slot| async move {
            (slot.worker.name().to_owned(), slot.task.await)
        }))
        .await;
        for (worker, result) in stopped {
            match result {
                Ok(exit) => tracing::debug!(%worker, %exit, "Worker stopped"),
                Err(err) => tracing::warn!(%worker, error = %err, "Worker supervisor task failed"),
            }
        }
        Ok(())
    }

    fn destroy(&self) {
        self.cancel.cancel();
    }
}

impl ModuleFactory for Scripts {
    const NAME: &'static str = "scripts";

    fn build(ctx: ModuleCtx, _deps: &Resolved) -> anyhow::Result<Self> {
        let config: ScriptsConfig = ctx.config("scripts")?;
        Ok(Self {
            cancel: ctx.cancellation_token().child_token(),
            config,
            ctx,
            slots: Mutex::new(HashMap::new()),
        })
    }
}

impl Scripts {
    #[must_use]
    pub fn scripts_path(&self) -> Option<&Path> {
        self.config.path.as_deref()
    }

    /// Spawns `<scripts path>/<file_name>` as worker `name` and supervises it.
    ///
    /// A stopped slot of the same name is replaced.
    ///
    /// # Errors
    /// `WorkerExists` while a slot named `name` is live, `ScriptsPathMissing`,
    /// `Spawn` when the first process cannot be started, `ShuttingDown` after
    /// the container was destroyed.
    pub fn start_worker(
        &self,
        name: &str,
        file_name: impl AsRef<Path>,
        options: WorkerOptions,
    ) -> Result<Worker, ScriptsError> {
        if self.cancel.is_cancelled() {
            return Err(ScriptsError::ShuttingDown);
        }
        let path = self
            .config
            .path
            .as_ref()
            .ok_or(ScriptsError::ScriptsPathMissing)?
            .join(file_name);

        let mut slots = self.slots.lock();
        if slots.get(name).is_some_and(|slot| !slot.worker.is_stopped()) {
            return Err(ScriptsError::WorkerExists {
                name: name.to_owned(),
            });
        }

        let worker = Worker::new(name, options, self.cancel.child_token());
        let child = process::spawn(name, &path, self.ctx.environment(), worker.options())?;
        let container = self.ctx.container();
        let supervision = Supervision {
            worker: worker.clone(),
            path,
            environment: self.ctx.environment().clone(),
            dispatcher: container.clone(),
            logs: container.log_bus(),
            metrics: container.metric_bus(),
            log: self.ctx.log().clone(),
            metric: self.ctx.metric().clone(),
        };
        tracing::info!(worker = %name, path = %supervision.path.display(), pid = child.id(), "Starting worker");
        let task = tokio::spawn(supervision.run(child));
        slots.insert(
            name.to_owned(),
            Slot {
                worker: worker.clone(),
                task,
            },
        );
        Ok(worker)
    }

    /// Stops worker `name`: SIGTERM, SIGKILL after `stop_grace`. Removes the
    /// slot and returns how the last process ended.
    ///
    /// # Errors
    /// `WorkerNotFound` for an unknown name, `Join` if the supervision task
    /// panicked.
    pub async fn stop_worker(&self, name: &str) -> Result<WorkerExit, ScriptsError> {
        let slot = self
            .slots
            .lock()
            .remove(name)
            .ok_or_else(|| ScriptsError::WorkerNotFound {
                name: name.to_owned(),
            })?;
        slot.worker.inner.cancel.cancel();
        slot.task.await.map_err(|source| ScriptsError::Join {
            name: name.to_owned(),
            source,
        })
    }

    #[must_use]
    pub fn worker(&self, name: &str) -> Option<Worker> {
        self.slots.lock().get(name).map(|slot| slot.worker.clone())
    }

    #[must_use]
    pub fn worker_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.slots.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

enum Trigger {
    Stop,
    Recycle(Duration),
    Exit(std::io::Result<std::process::ExitStatus>),
}

enum Outcome {
    Stopped,
    Exited,
    Recycled,
}

struct Supervision {
    worker: Worker,
    path: PathBuf,
    environment: Environment,
    dispatcher: ContainerHandle,
    logs: Option<Bus<LogRecord>>,
    metrics: Option<Bus<MetricRecord>>,
    log: ModuleLog,
    metric: ModuleMetric,
}

impl Supervision {
    async fn run(self, mut child: Child) -> WorkerExit {
        let worker = &self.worker;
        let name = worker.name();
        let options = worker.options();
        loop {
            let (exit, outcome) = self.run_process(child).await;
            worker.update(|s| {
                s.state = WorkerState::Exited;
                s.pid = None;
                s.last_exit = Some(exit.clone());
            });

            match outcome {
                Outcome::Stopped => {
                    tracing::info!(worker = %name, %exit, "Worker stopped");
                    return self.stopped(exit);
                }
                Outcome::Exited if exit.is_clean() => {
                    tracing::info!(worker = %name, %exit, "Worker exited");
                }
                Outcome::Exited => {
                    tracing::warn!(worker = %name, %exit, "Worker exited abnormally");
                    self.log.warning(format!("worker '{name}' exited with {exit}"));
                }
                Outcome::Recycled => {
                    tracing::info!(worker = %name, %exit, "Worker recycled");
                }
            }

            if !options.restart {
                return self.stopped(exit);
            }
            let restarts = worker.status().restart_count;
            if let Some(limit) = options.restart_limit
                && restarts >= limit
            {
                tracing::warn!(worker = %name, limit, "Worker reached its restart limit");
                self.log
                    .warning(format!("worker '{name}' reached its restart limit ({limit})"));
                return self.stopped(exit);
            }

            worker.update(|s| s.state = WorkerState::Restarting);
            tokio::select! {
                biased;
                () = worker.inner.cancel.cancelled() => return self.stopped(exit),
                () = tokio::time::sleep(options.restart_delay) => {}
            }

            worker.update(|s| s.restart_count += 1);
            self.metric.increment("worker.restarts");
            child = match process::spawn(name, &self.path, &self.environment, options) {
                Ok(child) => child,
                Err(err) => {
                    tracing::error!(worker = %name, error = %err, "Failed to restart worker");
                    self.log.error(format!("worker '{name}' could not be restarted: {err}"));
                    return self.stopped(exit);
                }
            };
            tracing::info!(worker = %name, pid = child.id(), restarts = restarts + 1, "Worker restarted");
        }
    }

    fn stopped(&self, exit: WorkerExit) -> WorkerExit {
        self.worker.update(|s| s.state = WorkerState::Stopped);
        exit
    }

    /// Attaches to `child` and waits until it exits, is stopped, or is recycled.
    async fn run_process(&self, mut child: Child) -> (WorkerExit, Outcome) {
        let worker = &self.worker;
        let name = worker.name();
        let options = worker.options();

        let forwarder = child
            .stderr
            .take()
            .map(|stderr| spawn_stderr_forwarder(stderr, name.to_owned(), worker.instance_id()));
        // Paused until the status listener exists and the handle is stored, so
        // neither early events nor early calls from the worker are lost.
        let channel = match (child.stdout.take(), child.stdin.take()) {
            (Some(stdout), Some(stdin)) => Some(
                self.open_channel()
                    .events(worker.inner.events.clone())
                    .paused()
                    .open(stdout, stdin),
            ),
            _ => None,
        };
        let recycle = uptime_exceeded(
            channel.as_ref().map(|channel| channel.listen(STATUS_EVENT)),
            options.uptime_limit,
        );
        tokio::pin!(recycle);

        worker.inner.channel.store(channel.clone().map(Arc::new));
        let pid = child.id();
        worker.update(|s| {
            s.state = WorkerState::Running;
            s.starts += 1;
            s.pid = pid;
        });
        if let Some(channel) = &channel {
            channel.resume();
        }

        let trigger = tokio::select! {
            biased;
            () = worker.inner.cancel.cancelled() => Trigger::Stop,
            uptime = &mut recycle => Trigger::Recycle(uptime),
            status = child.wait() => Trigger::Exit(status),
        };
        let (exit, outcome) = match trigger {
            Trigger::Exit(status) => (WorkerExit::from_wait(status), Outcome::Exited),
            Trigger::Stop => (
                process::stop_child_with_grace(name, &mut child, options.stop_grace).await,
                Outcome::Stopped,
            ),
            Trigger::Recycle(uptime) => {
                tracing::info!(worker = %name, ?uptime, limit = ?options.uptime_limit, "Uptime limit exceeded; recycling worker");
                (
                    process::stop_child_with_grace(name, &mut child, options.stop_grace).await,
                    Outcome::Recycled,
                )
            }
        };

        worker.inner.channel.store(None);
        if let Some(channel) = channel {
            channel.close();
        }
        if let Some(forwarder) = forwarder {
            _ = tokio::time::timeout(FORWARDER_DRAIN_TIMEOUT, forwarder).await;
        }
        (exit, outcome)
    }

    fn open_channel(&self) -> ChannelBuilder {
        let builder = Channel::builder(self.worker.name())
            .dispatcher(self.dispatcher.clone())
            .default_timeout(self.worker.options().call_timeout);
        match (&self.logs, &self.metrics) {
            (Some(logs), Some(metrics)) => builder.buses(logs.clone(), metrics.clone()),
            _ => builder,
        }
    }
}

/// Resolves with the reported uptime once it exceeds `limit`; never resolves
/// without a limit or after the channel closed.
async fn uptime_exceeded(
    statuses: Option<BoxStream<'static, Value>>,
    limit: Option<Duration>,
) -> Duration {
    if let (Some(mut statuses), Some(limit)) = (statuses, limit) {
        while let Some(status) = statuses.next().await {
            match serde_json::from_value::<ProcessStatus>(status) {
                Ok(status) if status.uptime() > limit => return status.uptime(),
                Ok(_) => {}
                Err(err) => tracing::debug!(error = %err, "Ignoring malformed process status"),
            }
        }
    }
    std::future::pending().await
}
