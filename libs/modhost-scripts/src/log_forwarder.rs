//! Forwards a worker's stderr to the parent's `tracing` output.
//!
//! Workers log through `tracing-subscriber` to stderr, either as text
//! (`2025-12-08T00:10:18.285Z  INFO target: message`) or as JSON lines with a
//! `"level"` field. Each line is re-emitted at the level it was written with,
//! tagged with the worker name and instance id.

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::Level;
use uuid::Uuid;

fn detect_log_level(line: &str) -> Level {
    detect_json_level(line)
        .or_else(|| detect_plain_level(line))
        .unwrap_or(Level::INFO)
}

fn parse_level(level: &str) -> Option<Level> {
    match level.to_ascii_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

fn detect_plain_level(line: &str) -> Option<Level> {
    let mut parts = line.split_whitespace();
    let _timestamp = parts.next()?;
    parse_level(parts.next()?)
}

fn detect_json_level(line: &str) -> Option<Level> {
    let trimmed = line.trim_start();
    if !trimmed.starts_with('{') || !trimmed.contains("\"level\"") {
        return None;
    }
    let v: Value = serde_json::from_str(trimmed).ok()?;
    parse_level(v.get("level")?.as_str()?)
}

fn forward_line(worker: &str, instance_id: Uuid, line: &str) {
    match detect_log_level(line) {
        Level::ERROR => tracing::error!(worker, %instance_id, "{line}"),
        Level::WARN => tracing::warn!(worker, %instance_id, "{line}"),
        Level::INFO => tracing::info!(worker, %instance_id, "{line}"),
        Level::DEBUG => tracing::debug!(worker, %instance_id, "{line}"),
        Level::TRACE => tracing::trace!(worker, %instance_id, "{line}"),
    }
}

/// Runs until the stream closes, which happens when the process exits.
pub(crate) fn spawn_stderr_forwarder<S>(stream: S, worker: String, instance_id: Uuid) -> JoinHandle<()>
where
    S: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => forward_line(&worker, instance_id, &line),
                Ok(None) => {
                    tracing::trace!(%worker, %instance_id, "stderr closed");
                    break;
                }
                Err(err) => {
                    tracing::warn!(%worker, %instance_id, error = %err, "stderr read error");
                    break;
                }
            }
        }
    })
}
