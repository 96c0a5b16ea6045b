use std::error::Error as StdError;
use std::time::Duration;

use modhost::RemoteError;
use tokio_util::codec::LinesCodecError;

/// Failures of an outbound call.
#[derive(thiserror::Error, Debug)]
pub enum CallError {
    #[error("call '{target}.{method}' timed out after {timeout:?}")]
    Timeout {
        target: String,
        method: String,
        timeout: Duration,
    },

    /// The remote side reported an error; the chain is preserved.
    #[error("remote call failed")]
    Remote(#[source] RemoteError),

    #[error("channel '{channel}' closed before the call finished")]
    ChannelClosed { channel: String },

    #[error("not connected to a parent process")]
    NotConnected,
}

impl CallError {
    #[must_use]
    pub fn as_label(&self) -> &'static str {
        match self {
            CallError::Timeout { .. } => "call_timeout",
            CallError::Remote(_) => "remote_error",
            CallError::ChannelClosed { .. } => "channel_closed",
            CallError::NotConnected => "not_connected",
        }
    }

    /// The reconstructed remote chain, when the failure came from the other side.
    #[must_use]
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            CallError::Remote(err) => Some(err),
            _ => None,
        }
    }
}

/// Framing failures. Malformed lines are skipped, so only I/O and encoding
/// failures surface.
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("channel I/O failed")]
    Io(#[from] std::io::Error),

    #[error("failed to encode envelope")]
    Encode(#[source] serde_json::Error),

    #[error("line framing failed")]
    Lines(#[source] LinesCodecError),
}

impl CodecError {
    #[must_use]
    pub fn as_label(&self) -> &'static str {
        match self {
            CodecError::Io(_) => "io_error",
            CodecError::Encode(_) => "encode_error",
            CodecError::Lines(_) => "framing_error",
        }
    }
}

impl From<LinesCodecError> for CodecError {
    fn from(err: LinesCodecError) -> Self {
        match err {
            LinesCodecError::Io(io) => CodecError::Io(io),
            other @ LinesCodecError::MaxLineLengthExceeded => CodecError::Lines(other),
        }
    }
}

/// Channel-level failures.
#[derive(thiserror::Error, Debug)]
pub enum ChannelError {
    #[error("channel '{channel}' is closed")]
    Closed { channel: String },

    #[error("not connected to a parent process")]
    NotConnected,

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl ChannelError {
    #[must_use]
    pub fn as_label(&self) -> &'static str {
        match self {
            ChannelError::Closed { .. } => "channel_closed",
            ChannelError::NotConnected => "not_connected",
            ChannelError::Codec(e) => e.as_label(),
        }
    }
}

fn ipc_label(err: &(dyn StdError + 'static)) -> Option<&'static str> {
    if let Some(e) = err.downcast_ref::<CallError>() {
        return Some(e.as_label());
    }
    if let Some(e) = err.downcast_ref::<ChannelError>() {
        return Some(e.as_label());
    }
    err.downcast_ref::<CodecError>().map(CodecError::as_label)
}

/// Serializable chain of `err`, labelling channel errors as well as the core ones.
#[must_use]
pub fn remote_error(err: &anyhow::Error) -> RemoteError {
    RemoteError::from_anyhow_with(err, ipc_label)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn nested_call_errors_keep_remote_chain() {
        let remote = RemoteError::new("method_not_found", "method 'nope' not found on 'calc'");
        let err = anyhow::Error::new(CallError::Remote(remote)).context("forwarding call");
        let chain = remote_error(&err);
        let names: Vec<_> = chain.names().collect();
        assert_eq!(names, ["error", "remote_error", "method_not_found"]);
    }

    #[test]
    fn labels() {
        assert_eq!(CallError::NotConnected.as_label(), "not_connected");
        let closed = ChannelError::Closed { channel: "w".into() };
        assert_eq!(closed.as_label(), "channel_closed");
    }
}
