//! Worker side of the parent channel.

use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use modhost::{LogLevel, Module, ModuleCtx, ModuleFactory, Resolved};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::{CallOptions, CallStream, Channel, ChannelBuilder};
use crate::error::{CallError, ChannelError};
use crate::status::{STATUS_EVENT, StatusCollector};

/// Connects a worker's container to its supervisor.
///
/// Inactive unless the host configuration carries a worker name. When active,
/// `up` attaches a channel over stdin/stdout that serves the container's
/// callable modules, forwards its buses, and reports `process.status`
/// heartbeats. Register it first so that script modules can depend on it.
pub struct ChildProcess {
    ctx: ModuleCtx,
    worker_name: Option<String>,
    status_interval: Duration,
    log_threshold: LogLevel,
    channel: OnceLock<Channel>,
    disconnected: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[async_trait]
impl Module for ChildProcess {
    async fn up(&self) -> anyhow::Result<()> {
        let Some(worker_name) = &self.worker_name else {
            tracing::debug!("No worker name configured; parent channel stays detached");
            return Ok(());
        };
        let container = self
            .ctx
            .container()
            .upgrade()
            .context("container dropped before the parent channel was attached")?;

        let channel = ChannelBuilder::new(worker_name.clone())
            .dispatcher(container.handle())
            .buses(container.log_bus(), container.metric_bus())
            .paused()
            .open(tokio::io::stdin(), tokio::io::stdout());

        let mut tasks = self.tasks.lock();
        tasks.push(channel.forward_bus(
            container.subscribe_logs(self.log_threshold),
            container.subscribe_metrics(&[]),
        ));
        tasks.push(spawn_heartbeat(channel.clone(), self.status_interval));

        let disconnected = self.disconnected.clone();
        let watched = channel.clone();
        tasks.push(tokio::spawn(async move {
            watched.closed().await;
            tracing::info!(channel = watched.name(), "Parent channel closed");
            disconnected.cancel();
        }));
        drop(tasks);

        // Inbound calls may log or call back; both need the subscriptions
        // above and the stored handle.
        if self.channel.set(channel.clone()).is_err() {
            channel.close();
            anyhow::bail!("parent channel is already attached");
        }
        channel.resume();
        tracing::info!(worker = %worker_name, "Attached to parent process");
        Ok(())
    }

    async fn down(&self) -> anyhow::Result<()> {
        if let Some(channel) = self.channel.get() {
            channel.close();
        }
        Ok(())
    }

    fn destroy(&self) {
        if let Some(channel) = self.channel.get() {
            channel.close();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl ModuleFactory for ChildProcess {
    const NAME: &'static str = "child_process";

    fn build(ctx: ModuleCtx, _deps: &Resolved) -> anyhow::Result<Self> {
        let cfg = ctx.host_config()?;
        Ok(Self {
            worker_name: cfg.worker_name.clone(),
            status_interval: cfg.status_interval,
            log_threshold: cfg.log_threshold(),
            ctx,
            channel: OnceLock::new(),
            disconnected: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

impl ChildProcess {
    #[must_use]
    pub fn is_worker(&self) -> bool {
        self.worker_name.is_some()
    }

    #[must_use]
    pub fn worker_name(&self) -> Option<&str> {
        self.worker_name.as_deref()
    }

    /// The parent channel, once attached.
    #[must_use]
    pub fn channel(&self) -> Option<&Channel> {
        self.channel.get()
    }

    /// Sends an event to the parent.
    ///
    /// # Errors
    /// `NotConnected` when no channel is attached, `Closed` after the parent
    /// went away.
    pub fn event(&self, name: impl Into<String>, data: Value) -> Result<(), ChannelError> {
        self.channel
            .get()
            .ok_or(ChannelError::NotConnected)?
            .event(name, data)
    }

    /// Events named `name` sent by the parent; empty when detached.
    #[must_use]
    pub fn listen(&self, name: impl Into<String>) -> BoxStream<'static, Value> {
        match self.channel.get() {
            Some(channel) => channel.listen(name),
            None => stream::empty().boxed(),
        }
    }

    /// Calls a callable module of the parent's container.
    #[must_use]
    pub fn call(
        &self,
        target: impl Into<String>,
        method: impl Into<String>,
        args: Vec<Value>,
        options: CallOptions,
    ) -> CallStream {
        match self.channel.get() {
            Some(channel) => channel.call(target, method, args, options),
            None => stream::once(async { Err(CallError::NotConnected) }).boxed(),
        }
    }

    /// Cancelled when the parent channel closes.
    #[must_use]
    pub fn disconnected(&self) -> CancellationToken {
        self.disconnected.clone()
    }
}

fn spawn_heartbeat(channel: Channel, every: Duration) -> JoinHandle<()> {
    let collector = StatusCollector::new();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = channel.closed() => break,
                _ = ticker.tick() => {}
            }
            let status = match serde_json::to_value(collector.sample()) {
                Ok(status) => status,
                Err(err) => {
                    tracing::warn!(error = %err, "Failed to encode process status");
                    continue;
                }
            };
            if channel.event(STATUS_EVENT, status).is_err() {
                break;
            }
        }
    })
}
