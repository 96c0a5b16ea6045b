//! Wire envelopes: `{"type": <u8>, "data": {...}}`, one per frame.

use modhost::{LogRecord, MetricRecord, RemoteError};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EnvelopeType {
    Log = 0,
    Metric = 1,
    Event = 2,
    CallRequest = 3,
    CallResponse = 4,
}

impl TryFrom<u8> for EnvelopeType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(EnvelopeType::Log),
            1 => Ok(EnvelopeType::Metric),
            2 => Ok(EnvelopeType::Event),
            3 => Ok(EnvelopeType::CallRequest),
            4 => Ok(EnvelopeType::CallResponse),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    pub id: u64,
    pub target: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// One record of a (possibly streaming) call result.
///
/// A call is finished by the first record carrying `error` or `complete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResponse {
    pub id: u64,
    /// `Some(Value::Null)` is a legitimate `null` result, distinct from absent.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub next: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub complete: bool,
}

fn present<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(d).map(Some)
}

impl CallResponse {
    #[must_use]
    pub fn next(id: u64, value: Value) -> Self {
        Self {
            id,
            next: Some(value),
            error: None,
            complete: false,
        }
    }

    #[must_use]
    pub fn error(id: u64, error: RemoteError) -> Self {
        Self {
            id,
            next: None,
            error: Some(error),
            complete: false,
        }
    }

    #[must_use]
    pub fn complete(id: u64) -> Self {
        Self {
            id,
            next: None,
            error: None,
            complete: true,
        }
    }

    /// Whether this record ends the call.
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.error.is_some() || self.complete
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Log(LogRecord),
    Metric(MetricRecord),
    Event(EventMessage),
    CallRequest(CallRequest),
    CallResponse(CallResponse),
}

impl Envelope {
    #[must_use]
    pub fn kind(&self) -> EnvelopeType {
        match self {
            Envelope::Log(_) => EnvelopeType::Log,
            Envelope::Metric(_) => EnvelopeType::Metric,
            Envelope::Event(_) => EnvelopeType::Event,
            Envelope::CallRequest(_) => EnvelopeType::CallRequest,
            Envelope::CallResponse(_) => EnvelopeType::CallResponse,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: u8,
    data: Value,
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::Error as _;

        let data = match self {
            Envelope::Log(v) => serde_json::to_value(v),
            Envelope::Metric(v) => serde_json::to_value(v),
            Envelope::Event(v) => serde_json::to_value(v),
            Envelope::CallRequest(v) => serde_json::to_value(v),
            Envelope::CallResponse(v) => serde_json::to_value(v),
        }
        .map_err(S::Error::custom)?;
        RawEnvelope {
            kind: self.kind() as u8,
            data,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawEnvelope::deserialize(deserializer)?;
        let kind = EnvelopeType::try_from(raw.kind)
            .map_err(|t| D::Error::custom(format!("unknown envelope type {t}")))?;
        let envelope = match kind {
            EnvelopeType::Log => serde_json::from_value(raw.data).map(Envelope::Log),
            EnvelopeType::Metric => serde_json::from_value(raw.data).map(Envelope::Metric),
            EnvelopeType::Event => serde_json::from_value(raw.data).map(Envelope::Event),
            EnvelopeType::CallRequest => serde_json::from_value(raw.data).map(Envelope::CallRequest),
            EnvelopeType::CallResponse => {
                serde_json::from_value(raw.data).map(Envelope::CallResponse)
            }
        };
        envelope.map_err(D::Error::custom)
    }
}
