//! Process logging: `tracing` subscriber setup and the bus-to-tracing bridge.
//!
//! Output always goes to stderr. A worker's stdout carries the channel
//! protocol, and its stderr is collected by the parent supervisor.

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{HostConfig, LogFormat};
use crate::container::Container;
use crate::records::{LogLevel, LogRecord};

/// Installs the global subscriber. Returns `false` when one was already set,
/// which is expected in tests.
pub fn init_logging(cfg: &HostConfig) -> bool {
    let filter = EnvFilter::try_new(&cfg.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = match cfg.log_format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .with_ansi(false)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(false)
            .with_writer(std::io::stderr)
            .boxed(),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .is_ok()
}

/// Re-emits container log records at `min_level` or above as `tracing` events.
/// Ends when the container is destroyed.
pub fn spawn_log_bridge(container: &Container, min_level: LogLevel) -> JoinHandle<()> {
    let mut records = container.subscribe_logs(min_level);
    tokio::spawn(async move {
        while let Some(record) = records.next().await {
            emit(&record);
        }
    })
}

fn emit(record: &LogRecord) {
    let source = record.source.as_str();
    let message = &record.message;
    let severity = record.level.as_str();
    match record.level {
        LogLevel::Emergency | LogLevel::Alert | LogLevel::Critical | LogLevel::Error => {
            tracing::error!(target: "modhost::bus", source, severity, "{message}");
        }
        LogLevel::Warning => tracing::warn!(target: "modhost::bus", source, severity, "{message}"),
        LogLevel::Notice | LogLevel::Informational => {
            tracing::info!(target: "modhost::bus", source, severity, "{message}");
        }
        LogLevel::Debug => tracing::debug!(target: "modhost::bus", source, severity, "{message}"),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::environment::Environment;

    #[tokio::test]
    async fn bridge_stops_on_destroy() {
        let container = Container::with_environment("bridge", Environment::new());
        let bridge = spawn_log_bridge(&container, LogLevel::Debug);
        container.send_log(LogRecord::new(LogLevel::Notice, "hello", "bridge.test"));
        container.destroy();
        tokio::time::timeout(std::time::Duration::from_secs(5), bridge)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn init_is_idempotent() {
        let cfg = HostConfig::default();
        let first = init_logging(&cfg);
        assert!(!init_logging(&cfg) || !first);
    }
}
