//! Per-module log and metric handles. Every record is stamped with the
//! module's `container.module` source.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::bus::Bus;
use crate::error::RemoteError;
use crate::records::{LogLevel, LogMessage, LogRecord, MetricKind, MetricRecord};

#[derive(Clone)]
pub struct ModuleLog {
    source: Arc<str>,
    bus: Bus<LogRecord>,
}

impl ModuleLog {
    pub fn new(source: impl Into<Arc<str>>, bus: Bus<LogRecord>) -> Self {
        Self {
            source: source.into(),
            bus,
        }
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn log(&self, level: LogLevel, message: impl Into<LogMessage>) {
        self.bus
            .publish(LogRecord::new(level, message, self.source.as_ref()));
    }

    pub fn log_with(
        &self,
        level: LogLevel,
        message: impl Into<LogMessage>,
        metadata: BTreeMap<String, Value>,
        args: Vec<Value>,
    ) {
        let mut record = LogRecord::new(level, message, self.source.as_ref());
        record.metadata = metadata;
        record.args = args;
        self.bus.publish(record);
    }

    pub fn emergency(&self, message: impl Into<LogMessage>) {
        self.log(LogLevel::Emergency, message);
    }

    pub fn alert(&self, message: impl Into<LogMessage>) {
        self.log(LogLevel::Alert, message);
    }

    pub fn critical(&self, message: impl Into<LogMessage>) {
        self.log(LogLevel::Critical, message);
    }

    pub fn error(&self, message: impl Into<LogMessage>) {
        self.log(LogLevel::Error, message);
    }

    pub fn warning(&self, message: impl Into<LogMessage>) {
        self.log(LogLevel::Warning, message);
    }

    pub fn notice(&self, message: impl Into<LogMessage>) {
        self.log(LogLevel::Notice, message);
    }

    pub fn info(&self, message: impl Into<LogMessage>) {
        self.log(LogLevel::Informational, message);
    }

    pub fn debug(&self, message: impl Into<LogMessage>) {
        self.log(LogLevel::Debug, message);
    }

    /// Logs the full chain of `err` as a structured message at `Error` level.
    pub fn error_chain(&self, err: &anyhow::Error) {
        self.log(LogLevel::Error, RemoteError::from_anyhow(err));
    }
}

#[derive(Clone)]
pub struct ModuleMetric {
    source: Arc<str>,
    bus: Bus<MetricRecord>,
}

impl ModuleMetric {
    pub fn new(source: impl Into<Arc<str>>, bus: Bus<MetricRecord>) -> Self {
        Self {
            source: source.into(),
            bus,
        }
    }

    pub fn send(&self, kind: MetricKind, name: &str, value: f64, tags: BTreeMap<String, String>) {
        let mut record = MetricRecord::new(kind, name, value, self.source.as_ref());
        record.tags = tags;
        self.bus.publish(record);
    }

    pub fn increment(&self, name: &str) {
        self.send(MetricKind::Increment, name, 1.0, BTreeMap::new());
    }

    pub fn decrement(&self, name: &str) {
        self.send(MetricKind::Decrement, name, 1.0, BTreeMap::new());
    }

    pub fn gauge(&self, name: &str, value: f64) {
        self.send(MetricKind::Gauge, name, value, BTreeMap::new());
    }

    /// Recorded in milliseconds.
    pub fn timing(&self, name: &str, elapsed: Duration) {
        self.send(
            MetricKind::Timing,
            name,
            elapsed.as_secs_f64() * 1_000.0,
            BTreeMap::new(),
        );
    }

    pub fn histogram(&self, name: &str, value: f64) {
        self.send(MetricKind::Histogram, name, value, BTreeMap::new());
    }
}
