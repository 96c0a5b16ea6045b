//! Log and metric records carried by the container buses and the worker channel.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RemoteError;

/// RFC 5424 severity. Lower values are more severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Emergency = 0,
    Alert = 1,
    Critical = 2,
    Error = 3,
    Warning = 4,
    Notice = 5,
    Informational = 6,
    Debug = 7,
}

impl LogLevel {
    #[must_use]
    pub fn severity(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Emergency => "emergency",
            LogLevel::Alert => "alert",
            LogLevel::Critical => "critical",
            LogLevel::Error => "error",
            LogLevel::Warning => "warning",
            LogLevel::Notice => "notice",
            LogLevel::Informational => "informational",
            LogLevel::Debug => "debug",
        }
    }

    /// Whether a record at `self` passes a `threshold` filter.
    #[must_use]
    pub fn passes(self, threshold: LogLevel) -> bool {
        self <= threshold
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown log level '{0}'")]
pub struct UnknownLogLevel(String);

/// Accepts RFC 5424 names and the usual `tracing` spellings.
impl FromStr for LogLevel {
    type Err = UnknownLogLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let level = match s.trim().to_ascii_lowercase().as_str() {
            "emergency" | "emerg" => LogLevel::Emergency,
            "alert" => LogLevel::Alert,
            "critical" | "crit" => LogLevel::Critical,
            "error" | "err" => LogLevel::Error,
            "warning" | "warn" => LogLevel::Warning,
            "notice" => LogLevel::Notice,
            "informational" | "info" => LogLevel::Informational,
            "debug" | "trace" => LogLevel::Debug,
            _ => return Err(UnknownLogLevel(s.to_owned())),
        };
        Ok(level)
    }
}

/// Either plain text or a structured error chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LogMessage {
    Text(String),
    Error(RemoteError),
}

impl fmt::Display for LogMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogMessage::Text(text) => f.write_str(text),
            LogMessage::Error(err) => {
                write!(f, "{err}")?;
                for cause in err.chain().skip(1) {
                    write!(f, ": {cause}")?;
                }
                Ok(())
            }
        }
    }
}

impl From<&str> for LogMessage {
    fn from(value: &str) -> Self {
        LogMessage::Text(value.to_owned())
    }
}

impl From<String> for LogMessage {
    fn from(value: String) -> Self {
        LogMessage::Text(value)
    }
}

impl From<RemoteError> for LogMessage {
    fn from(value: RemoteError) -> Self {
        LogMessage::Error(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: LogMessage,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
    /// `container.module` of the emitter.
    #[serde(default)]
    pub source: String,
}

impl LogRecord {
    pub fn new(level: LogLevel, message: impl Into<LogMessage>, source: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            metadata: BTreeMap::new(),
            args: Vec::new(),
            source: source.into(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Increment,
    Decrement,
    Gauge,
    Timing,
    Histogram,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    #[serde(rename = "type")]
    pub kind: MetricKind,
    pub name: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub source: String,
}

impl MetricRecord {
    pub fn new(kind: MetricKind, name: impl Into<String>, value: f64, source: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            value,
            tags: BTreeMap::new(),
            source: source.into(),
        }
    }

    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}
