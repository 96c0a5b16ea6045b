//! Newline-delimited JSON framing for [`Envelope`]s.

use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::envelope::Envelope;
use crate::error::CodecError;

/// Maximum length of one encoded envelope (16 MiB).
pub const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// Blank lines are ignored. Malformed or oversized lines are logged and
/// skipped so that one bad frame does not tear down the channel.
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    lines: LinesCodec,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvelopeCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_LENGTH)
    }

    #[must_use]
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_length),
        }
    }

    fn next_envelope(
        &mut self,
        src: &mut BytesMut,
        eof: bool,
    ) -> Result<Option<Envelope>, CodecError> {
        loop {
            let line = if eof {
                self.lines.decode_eof(src)
            } else {
                self.lines.decode(src)
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(None),
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    tracing::warn!(max = self.lines.max_length(), "dropping oversized envelope");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(envelope) => return Ok(Some(envelope)),
                Err(err) => {
                    tracing::warn!(error = %err, "dropping malformed envelope");
                }
            }
        }
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.next_envelope(src, false)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.next_envelope(src, true)
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = serde_json::to_string(&item).map_err(CodecError::Encode)?;
        self.lines.encode(line, dst)?;
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::envelope::EventMessage;
    use serde_json::json;

    fn event(name: &str) -> Envelope {
        Envelope::Event(EventMessage {
            name: name.into(),
            data: json!(1),
        })
    }

    #[test]
    fn encodes_one_line_per_envelope() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(event("a"), &mut buf).unwrap();
        codec.encode(event("b"), &mut buf).unwrap();
        let text = std::str::from_utf8(&buf).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.ends_with('\n'));

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(event("a")));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(event("b")));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn skips_garbage_and_blank_lines() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::from(
            "\nnot json\n{\"type\":2,\"data\":{\"name\":\"a\",\"data\":1}}\n".as_bytes(),
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(event("a")));
    }

    #[test]
    fn partial_line_waits_for_more() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::from("{\"type\":2,".as_bytes());
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"\"data\":{\"name\":\"a\",\"data\":1}}");
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some(event("a")));
    }

    #[test]
    fn oversized_line_is_dropped() {
        let mut codec = EnvelopeCodec::with_max_length(32);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[b'x'; 64]);
        buf.extend_from_slice(b"\n{\"type\":2,\"data\":{\"name\":\"a\"}}\n");
        let got = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(got, Envelope::Event(e) if e.name == "a" && e.data.is_null()));
    }
}
