#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![forbid(unsafe_code)]

//! Parent/worker channel for `ModHost`.
//!
//! One [`Channel`] per duplex byte stream. On top of newline-delimited JSON
//! envelopes it carries remote calls with streamed results, named events, and
//! the log/metric records of the worker's container.
//!
//! The worker side is the [`ChildProcess`] module: registered in a worker's
//! container it attaches the channel over stdin/stdout and reports
//! `process.status` heartbeats.

pub mod channel;
pub mod child;
pub mod codec;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod status;

pub use channel::{CallOptions, CallStream, Channel, ChannelBuilder, DEFAULT_CALL_TIMEOUT};
pub use child::ChildProcess;
pub use codec::{EnvelopeCodec, MAX_LINE_LENGTH};
pub use dispatch::{CallDispatcher, NoDispatch};
pub use envelope::{CallRequest, CallResponse, Envelope, EnvelopeType, EventMessage};
pub use error::{CallError, ChannelError, CodecError, remote_error};
pub use modhost::RemoteError;
pub use status::{ProcessStatus, STATUS_EVENT, StatusCollector};
