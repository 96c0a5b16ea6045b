//! Process status reported by workers in the `process.status` heartbeat.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Event name of the worker heartbeat.
pub const STATUS_EVENT: &str = "process.status";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessStatus {
    pub pid: u32,
    /// Seconds since the worker process started its container.
    pub uptime: f64,
    /// CPU usage in percent since the previous sample.
    pub cpu: f32,
    /// Resident memory in bytes.
    pub memory: u64,
}

impl ProcessStatus {
    #[must_use]
    pub fn uptime(&self) -> Duration {
        Duration::try_from_secs_f64(self.uptime).unwrap_or_default()
    }
}

/// Samples the current process.
pub struct StatusCollector {
    pid: Pid,
    started: Instant,
    system: Mutex<System>,
}

impl Default for StatusCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusCollector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pid: Pid::from_u32(std::process::id()),
            started: Instant::now(),
            system: Mutex::new(System::new()),
        }
    }

    #[must_use]
    pub fn sample(&self) -> ProcessStatus {
        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        let (cpu, memory) = system
            .process(self.pid)
            .map_or((0.0, 0), |p| (p.cpu_usage(), p.memory()));
        ProcessStatus {
            pid: self.pid.as_u32(),
            uptime: self.started.elapsed().as_secs_f64(),
            cpu,
            memory,
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn samples_own_process() {
        let collector = StatusCollector::new();
        let status = collector.sample();
        assert_eq!(status.pid, std::process::id());
        assert!(status.memory > 0);
        assert!(status.uptime >= 0.0);
    }

    #[test]
    fn uptime_converts_from_seconds() {
        let status: ProcessStatus =
            serde_json::from_str(r#"{"pid":1,"uptime":1.5,"cpu":0.0,"memory":0}"#).unwrap();
        assert_eq!(status.uptime(), Duration::from_millis(1500));
    }
}
