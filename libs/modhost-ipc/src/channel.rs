//! Duplex envelope channel.
//!
//! A [`Channel`] owns two tasks over one transport: a writer draining the
//! outbound queue into the framed sink, and a reader routing inbound
//! envelopes. Responses are matched to pending calls by correlation id,
//! events fan out to every listener, log/metric records are re-published on
//! the local buses, and inbound calls are served through a [`CallDispatcher`].
//!
//! A channel opened [`paused`](ChannelBuilder::paused) writes immediately
//! but routes nothing until [`Channel::resume`], so the owner can subscribe
//! and publish the handle before the first inbound envelope is served.
//!
//! The channel closes when the transport reaches EOF or fails, when
//! [`Channel::close`] is called, or when the last handle is dropped. Pending
//! calls then fail with [`CallError::ChannelClosed`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::stream::{self, BoxStream};
use futures::{SinkExt, StreamExt};
use modhost::{Bus, BusStream, LogRecord, MetricRecord, scope};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::codec::EnvelopeCodec;
use crate::dispatch::{CallDispatcher, NoDispatch};
use crate::envelope::{CallRequest, CallResponse, Envelope, EventMessage};
use crate::error::{CallError, ChannelError, remote_error};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

const EVENT_CAPACITY: usize = 1024;

/// Result values of an outbound call, in the order the remote produced them.
pub type CallStream = BoxStream<'static, Result<Value, CallError>>;

#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    /// Overrides the channel's default call timeout.
    pub timeout: Option<Duration>,
}

impl CallOptions {
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

pub struct ChannelBuilder {
    name: String,
    dispatcher: Arc<dyn CallDispatcher>,
    logs: Option<Bus<LogRecord>>,
    metrics: Option<Bus<MetricRecord>>,
    events: Option<broadcast::Sender<EventMessage>>,
    paused: bool,
    default_timeout: Duration,
}

impl ChannelBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dispatcher: Arc::new(NoDispatch),
            logs: None,
            metrics: None,
            events: None,
            paused: false,
            default_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Serves inbound calls. Without one every inbound call fails with
    /// `target_not_found`.
    #[must_use]
    pub fn dispatcher(mut self, dispatcher: impl CallDispatcher) -> Self {
        self.dispatcher = Arc::new(dispatcher);
        self
    }

    /// Buses that inbound log and metric records are re-published on.
    #[must_use]
    pub fn buses(mut self, logs: Bus<LogRecord>, metrics: Bus<MetricRecord>) -> Self {
        self.logs = Some(logs);
        self.metrics = Some(metrics);
        self
    }

    /// Publishes inbound events on `sender` instead of a channel-owned one.
    /// Receivers subscribed before `open` see every event of the connection.
    #[must_use]
    pub fn events(mut self, sender: broadcast::Sender<EventMessage>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Holds inbound routing until [`Channel::resume`].
    #[must_use]
    pub fn paused(mut self) -> Self {
        self.paused = true;
        self
    }

    #[must_use]
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Starts the reader and writer tasks. Must run inside a Tokio runtime.
    pub fn open<R, W>(self, reader: R, writer: W) -> Channel
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let events = self
            .events
            .unwrap_or_else(|| broadcast::channel(EVENT_CAPACITY).0);
        let closed = CancellationToken::new();
        let reading = CancellationToken::new();
        if !self.paused {
            reading.cancel();
        }
        let shared = Arc::new(Shared {
            name: self.name.into(),
            next_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            outbound,
            events,
            closed: closed.clone(),
            reading,
            default_timeout: self.default_timeout,
        });

        tokio::spawn(write_loop(
            shared.name.clone(),
            closed.clone(),
            outbound_rx,
            FramedWrite::new(writer, EnvelopeCodec::new()),
        ));
        tokio::spawn(read_loop(
            shared.clone(),
            FramedRead::new(reader, EnvelopeCodec::new()),
            Inbound {
                dispatcher: self.dispatcher,
                logs: self.logs,
                metrics: self.metrics,
            },
        ));
        tracing::debug!(channel = %shared.name, "Channel opened");

        Channel {
            shared,
            _guard: Arc::new(CloseOnDrop(closed)),
        }
    }
}

struct Shared {
    name: Arc<str>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, mpsc::UnboundedSender<CallResponse>>>,
    outbound: mpsc::UnboundedSender<Envelope>,
    events: broadcast::Sender<EventMessage>,
    closed: CancellationToken,
    /// Cancelled once inbound envelopes may be routed.
    reading: CancellationToken,
    default_timeout: Duration,
}

impl Shared {
    fn send(&self, envelope: Envelope) -> Result<(), ChannelError> {
        if self.closed.is_cancelled() {
            return Err(self.closed_error());
        }
        self.outbound
            .send(envelope)
            .map_err(|_| self.closed_error())
    }

    fn closed_error(&self) -> ChannelError {
        ChannelError::Closed {
            channel: self.name.to_string(),
        }
    }

    /// Cancels the channel and fails every pending call.
    fn shut(&self) {
        self.closed.cancel();
        let abandoned: Vec<_> = self.pending.lock().drain().collect();
        if !abandoned.is_empty() {
            tracing::debug!(channel = %self.name, calls = abandoned.len(), "Failing pending calls");
        }
    }
}

struct CloseOnDrop(CancellationToken);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Handle to an open channel. Clones share the connection.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<Shared>,
    _guard: Arc<CloseOnDrop>,
}

impl Channel {
    #[must_use]
    pub fn builder(name: impl Into<String>) -> ChannelBuilder {
        ChannelBuilder::new(name)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Calls `target.method(args)` on the other side.
    ///
    /// Nothing is sent until the stream is first polled; the timeout runs from
    /// that send and covers the whole call. Dropping the stream abandons the
    /// call and any later response for it is ignored.
    #[must_use]
    pub fn call(
        &self,
        target: impl Into<String>,
        method: impl Into<String>,
        args: Vec<Value>,
        options: CallOptions,
    ) -> CallStream {
        let call = PendingCall {
            id: self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            target: target.into(),
            method: method.into(),
            timeout: options.timeout.unwrap_or(self.shared.default_timeout),
            shared: self.shared.clone(),
            state: CallState::Unsent(args),
        };
        stream::unfold(call, |mut call| async move {
            let item = call.next().await?;
            Some((item, call))
        })
        .boxed()
    }

    /// First value of the call; `Value::Null` when it completes without one.
    ///
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

    /// Every value of the call.
    ///
    /// # Errors
    /// The first [`CallError`] of the call; values before it are discarded.
    pub async fn call_collect(
        &self,
        target: impl Into<String>,
        method: impl Into<String>,
        args: Vec<Value>,
        options: CallOptions,
    ) -> Result<Vec<Value>, CallError> {
        let mut results = self.call(target, method, args, options);
        let mut values = Vec::new();
        while let Some(value) = results.next().await {
            values.push(value?);
        }
        Ok(values)
    }

    /// # Errors
    /// `ChannelError::Closed` once the channel is closed.
    pub fn event(&self, name: impl Into<String>, data: Value) -> Result<(), ChannelError> {
        self.shared.send(Envelope::Event(EventMessage {
            name: name.into(),
            data,
        }))
    }

    /// Payloads of inbound events named `name`, from now until the channel
    /// closes. Each call is an independent subscription.
    #[must_use]
    pub fn listen(&self, name: impl Into<String>) -> BoxStream<'static, Value> {
        let name = name.into();
        self.events()
            .filter_map(move |event| {
                let matched = (event.name == name).then_some(event.data);
                async move { matched }
            })
            .boxed()
    }

    /// Every inbound event until the channel closes.
    #[must_use]
    pub fn events(&self) -> BoxStream<'static, EventMessage> {
        let channel = self.shared.name.clone();
        BroadcastStream::new(self.shared.events.subscribe())
            .filter_map(move |event| {
                let event = event
                    .inspect_err(|err| tracing::warn!(%channel, error = %err, "event listener lagged"))
                    .ok();
                async move { event }
            })
            .take_until(self.shared.closed.clone().cancelled_owned())
            .boxed()
    }

    /// # Errors
    /// `ChannelError::Closed` once the channel is closed.
    pub fn send_log(&self, record: LogRecord) -> Result<(), ChannelError> {
        self.shared.send(Envelope::Log(record))
    }

    /// # Errors
    /// `ChannelError::Closed` once the channel is closed.
    pub fn send_metric(&self, record: MetricRecord) -> Result<(), ChannelError> {
        self.shared.send(Envelope::Metric(record))
    }

    /// Sends every record of `logs` and `metrics` to the other side until the
    /// channel closes or both streams end.
    pub fn forward_bus(
        &self,
        logs: BusStream<LogRecord>,
        metrics: BusStream<MetricRecord>,
    ) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let mut records = stream::select(logs.map(Envelope::Log), metrics.map(Envelope::Metric))
            .take_until(self.shared.closed.clone().cancelled_owned())
            .boxed();
        tokio::spawn(async move {
            while let Some(envelope) = records.next().await {
                if shared.send(envelope).is_err() {
                    break;
                }
            }
        })
    }

    /// Starts routing inbound envelopes of a [`paused`](ChannelBuilder::paused)
    /// channel. No-op otherwise.
    pub fn resume(&self) {
        self.shared.reading.cancel();
    }

    /// Resolves when the channel is closed for any reason.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await;
    }

    /// Token cancelled when the channel closes.
    #[must_use]
    pub fn closed_token(&self) -> CancellationToken {
        self.shared.closed.clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    pub fn close(&self) {
        self.shared.shut();
    }

    /// Outbound calls still waiting for their final response.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.lock().len()
    }
}

enum CallState {
    Unsent(Vec<Value>),
    Waiting {
        responses: mpsc::UnboundedReceiver<CallResponse>,
        deadline: Instant,
    },
    Finished,
}

struct PendingCall {
    id: u64,
    target: String,
    method: String,
    timeout: Duration,
    shared: Arc<Shared>,
    state: CallState,
}

impl PendingCall {
    async fn next(&mut self) -> Option<Result<Value, CallError>> {
        if let CallState::Unsent(args) = &mut self.state {
            let args = std::mem::take(args);
            match self.send(args) {
                Ok(waiting) => self.state = waiting,
                Err(err) => {
                    self.finish();
                    return Some(Err(err));
                }
            }
        }

        loop {
            let CallState::Waiting {
                responses,
                deadline,
            } = &mut self.state
            else {
                return None;
            };
            let result = match tokio::time::timeout_at(*deadline, responses.recv()).await {
                Err(_) => Err(CallError::Timeout {
                    target: self.target.clone(),
                    method: self.method.clone(),
                    timeout: self.timeout,
                }),
                Ok(None) => Err(self.closed_error()),
                Ok(Some(response)) => {
                    if let Some(error) = response.error {
                        Err(CallError::Remote(error))
                    } else if let Some(value) = response.next {
                        if response.complete {
                            self.finish();
                        }
                        return Some(Ok(value));
                    } else if response.complete {
                        self.finish();
                        return None;
                    } else {
                        continue;
                    }
                }
            };
            self.finish();
            return Some(result);
        }
    }

    fn send(&self, args: Vec<Value>) -> Result<CallState, CallError> {
        let (tx, responses) = mpsc::unbounded_channel();
        self.shared.pending.lock().insert(self.id, tx);
        // Registered before the closed check: a concurrent shutdown either
        // drains this entry or is observed here.
        if self.shared.closed.is_cancelled() {
            return Err(self.closed_error());
        }
        self.shared
            .send(Envelope::CallRequest(CallRequest {
                id: self.id,
                target: self.target.clone(),
                method: self.method.clone(),
                args,
            }))
            .map_err(|_| self.closed_error())?;
        tracing::trace!(channel = %self.shared.name, id = self.id, target = %self.target, method = %self.method, "Call sent");
        Ok(CallState::Waiting {
            responses,
            deadline: Instant::now() + self.timeout,
        })
    }

    fn closed_error(&self) -> CallError {
        CallError::ChannelClosed {
            channel: self.shared.name.to_string(),
        }
    }

    fn finish(&mut self) {
        self.state = CallState::Finished;
        self.shared.pending.lock().remove(&self.id);
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.shared.pending.lock().remove(&self.id);
    }
}

struct Inbound {
    dispatcher: Arc<dyn CallDispatcher>,
    logs: Option<Bus<LogRecord>>,
    metrics: Option<Bus<MetricRecord>>,
}

async fn write_loop<W>(
    channel: Arc<str>,
    closed: CancellationToken,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
    mut sink: FramedWrite<W, EnvelopeCodec>,
) where
    W: AsyncWrite + Send + Unpin,
{
    loop {
        let envelope = tokio::select! {
            biased;
            envelope = outbound.recv() => envelope,
            () = closed.cancelled() => None,
        };
        let Some(envelope) = envelope else { break };
        if let Err(err) = sink.send(envelope).await {
            tracing::warn!(%channel, error = %err, "Channel write failed");
            closed.cancel();
            break;
        }
    }
    if let Err(err) = sink.close().await {
        tracing::debug!(%channel, error = %err, "Channel writer did not shut down cleanly");
    }
}

async fn read_loop<R>(shared: Arc<Shared>, mut frames: FramedRead<R, EnvelopeCodec>, inbound: Inbound)
where
    R: AsyncRead + Send + Unpin,
{
    tokio::select! {
        () = shared.closed.cancelled() => {
            shared.shut();
            return;
        }
        () = shared.reading.cancelled() => {}
    }
    loop {
        let frame = tokio::select! {
            () = shared.closed.cancelled() => break,
            frame = frames.next() => frame,
        };
        match frame {
            Some(Ok(envelope)) => route(&shared, &inbound, envelope),
            Some(Err(err)) => {
                tracing::warn!(channel = %shared.name, error = %err, "Channel read failed");
                break;
            }
            None => {
                tracing::debug!(channel = %shared.name, "Channel reached EOF");
                break;
            }
        }
    }
    shared.shut();
}

fn route(shared: &Arc<Shared>, inbound: &Inbound, envelope: Envelope) {
    match envelope {
        Envelope::CallResponse(response) => {
            let id = response.id;
            let waiter = {
                let mut pending = shared.pending.lock();
                if response.is_final() {
                    pending.remove(&id)
                } else {
                    pending.get(&id).cloned()
                }
            };
            match waiter {
                Some(waiter) => {
                    // The caller may have dropped its stream in the meantime.
                    _ = waiter.send(response);
                }
                None => tracing::debug!(channel = %shared.name, id, "Ignoring stale call response"),
            }
        }
        Envelope::CallRequest(request) => {
            tokio::spawn(serve_call(shared.clone(), inbound.dispatcher.clone(), request));
        }
        Envelope::Event(event) => {
            // Err only means nobody is listening.
            _ = shared.events.send(event);
        }
        Envelope::Log(record) => {
            if let Some(logs) = &inbound.logs {
                logs.publish(record);
            }
        }
        Envelope::Metric(record) => {
            if let Some(metrics) = &inbound.metrics {
                metrics.publish(record);
            }
        }
    }
}

async fn serve_call(shared: Arc<Shared>, dispatcher: Arc<dyn CallDispatcher>, request: CallRequest) {
    let CallRequest {
        id,
        target,
        method,
        args,
    } = request;
    let values = scope::ScopeValues::new()
        .with("call.id", id)
        .with("call.target", target.clone())
        .with("call.method", method.clone());

    scope::run(values, async move {
        let mut results = match dispatcher.dispatch(&target, &method, args) {
            Ok(results) => results,
            Err(err) => {
                tracing::debug!(channel = %shared.name, id, %target, %method, error = %err, "Call rejected");
                let error = modhost::RemoteError::from_error(&err);
                _ = shared.send(Envelope::CallResponse(CallResponse::error(id, error)));
                return;
            }
        };
        loop {
            let item = tokio::select! {
                () = shared.closed.cancelled() => return,
                item = results.next() => item,
            };
            let (response, last) = match item {
                Some(Ok(value)) => (CallResponse::next(id, value), false),
                Some(Err(err)) => (CallResponse::error(id, remote_error(&err)), true),
                None => (CallResponse::complete(id), true),
            };
            if shared.send(Envelope::CallResponse(response)).is_err() || last {
                return;
            }
        }
    })
    .await;
}
