//! Worker slots and the handle callers use to reach them.

use std::fmt;
use std::process::ExitStatus;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use modhost_ipc::{CallError, CallOptions, CallStream, Channel, ChannelError, EventMessage};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::options::WorkerOptions;

const EVENT_CAPACITY: usize = 1024;

/// `Starting → Running → (Exited → Restarting → Running)* → Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Starting,
    Running,
    Exited,
    Restarting,
    Stopped,
}

impl WorkerState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Exited => "exited",
            WorkerState::Restarting => "restarting",
            WorkerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a worker process ended: an exit code, or the name of the signal that
/// killed it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerExit {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

impl WorkerExit {
    #[must_use]
    pub fn from_status(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: crate::process::signal_name(status),
        }
    }

    /// An unknown exit when waiting on the process itself failed.
    #[must_use]
    pub fn from_wait(status: std::io::Result<ExitStatus>) -> Self {
        match status {
            Ok(status) => Self::from_status(status),
            Err(err) => {
                tracing::warn!(error = %err, "Failed to wait for worker process");
                Self::default()
            }
        }
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.code, &self.signal) {
            (Some(code), _) => write!(f, "code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown exit"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub state: WorkerState,
    /// Restarts performed so far; never decreases.
    pub restart_count: u32,
    /// Processes spawned so far, the first one included.
    pub starts: u32,
    pub pid: Option<u32>,
    pub last_exit: Option<WorkerExit>,
}

impl Default for WorkerStatus {
    fn default() -> Self {
        Self {
            state: WorkerState::Starting,
            restart_count: 0,
            starts: 0,
            pid: None,
            last_exit: None,
        }
    }
}

pub(crate) struct WorkerInner {
    pub(crate) name: String,
    pub(crate) instance_id: Uuid,
    pub(crate) options: WorkerOptions,
    pub(crate) channel: ArcSwapOption<Channel>,
    pub(crate) events: broadcast::Sender<EventMessage>,
    pub(crate) status: watch::Sender<WorkerStatus>,
    pub(crate) cancel: CancellationToken,
}

/// Handle to a worker slot. Stays valid across restarts; calls and events go
/// to whichever process is current.
#[derive(Clone)]
pub struct Worker {
    pub(crate) inner: Arc<WorkerInner>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.inner.name)
            .field("instance_id", &self.inner.instance_id)
            .field("status", &*self.inner.status.borrow())
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub(crate) fn new(name: &str, options: WorkerOptions, cancel: CancellationToken) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (status, _) = watch::channel(WorkerStatus::default());
        Self {
            inner: Arc::new(WorkerInner {
                name: name.to_owned(),
                instance_id: Uuid::now_v7(),
                options,
                channel: ArcSwapOption::empty(),
                events,
                status,
                cancel,
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn instance_id(&self) -> Uuid {
        self.inner.instance_id
    }

    #[must_use]
    pub fn options(&self) -> &WorkerOptions {
        &self.inner.options
    }

    /// Calls `target.method(args)` in the current process. Fails with
    /// `NotConnected` while no process is attached.
    #[must_use]
    pub fn call(
        &self,
        target: impl Into<String>,
        method: impl Into<String>,
        args: Vec<Value>,
        options: CallOptions,
    ) -> CallStream {
        match self.inner.channel.load_full() {
            Some(channel) => channel.call(target, method, args, options),
            None => stream::once(async { Err(CallError::NotConnected) }).boxed(),
        }
    }

    /// # Errors
    /// Any [`CallError`] of the call.
    pub async fn call_one(
        &self,
        target: impl Into<String>,
        method: impl Into<String>,
        args: Vec<Value>,
        options: CallOptions,
    ) -> Result<Value, CallError> {
        let mut results = self.call(target, method, args, options);
        results.next().await.unwrap_or(Ok(Value::Null))
    }

    /// # Errors
    /// `NotConnected` while no process is attached.
    pub fn event(&self, name: impl Into<String>, data: Value) -> Result<(), ChannelError> {
        self.inner
            .channel
            .load_full()
            .ok_or(ChannelError::NotConnected)?
            .event(name, data)
    }

    /// Events named `name` from any process of this worker, until the slot
    /// stops.
    #[must_use]
    pub fn listen(&self, name: impl Into<String>) -> BoxStream<'static, Value> {
        let name = name.into();
        BroadcastStream::new(self.inner.events.subscribe())
            .filter_map(move |event| {
                let data = event.ok().filter(|e| e.name == name).map(|e| e.data);
                async move { data }
            })
            .take_until(self.inner.cancel.clone().cancelled_owned())
            .boxed()
    }

    #[must_use]
    pub fn status(&self) -> WorkerStatus {
        self.inner.status.borrow().clone()
    }

    #[must_use]
    pub fn status_changes(&self) -> watch::Receiver<WorkerStatus> {
        self.inner.status.subscribe()
    }

    /// Waits until the worker reaches `state` and returns that status.
    pub async fn wait_for_state(&self, state: WorkerState) -> WorkerStatus {
        let mut rx = self.inner.status.subscribe();
        // The sender lives as long as `self`, so the wait cannot fail.
        match rx.wait_for(|s| s.state == state).await {
            Ok(status) => status.clone(),
            Err(_) => self.status(),
        }
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.status.borrow().state == WorkerState::Stopped
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut WorkerStatus)) {
        self.inner.status.send_modify(f);
    }
}
