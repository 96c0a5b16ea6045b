#![cfg(unix)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

//! End-to-end supervision of real worker processes.
//!
//! The parent container hosts `scripts` plus a callable `host` module; each
//! test starts this crate's binary as a worker running one built-in script.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use modhost::contracts::method;
use modhost::{
    CallableModule, Container, Environment, LogLevel, MethodError, MethodStream, Module,
    ModuleCtx, ModuleFactory, Resolved, async_trait,
};
use modhost_ipc::{CallError, CallOptions, STATUS_EVENT};
use modhost_scripts::{Scripts, Worker, WorkerOptions, WorkerState, WorkerStatus};
use serde_json::{Value, json};

const T: Duration = Duration::from_secs(15);
const WORKER_EXE: &str = env!("CARGO_BIN_EXE_modhost-worker");

/// Parent-side callable reached by workers through `calc.ask`.
struct Host;

#[async_trait]
impl Module for Host {}

impl ModuleFactory for Host {
    const NAME: &'static str = "host";
    fn build(_ctx: ModuleCtx, _deps: &Resolved) -> anyhow::Result<Self> {
        Ok(Host)
    }
}

impl CallableModule for Host {
    fn call(&self, name: &str, args: Vec<Value>) -> Result<MethodStream, MethodError> {
        match name {
            "greet" => {
                let who = args.first().and_then(Value::as_str).unwrap_or("stranger");
                Ok(method::value(json!(format!("hello {who}"))))
            }
            _ => Err(MethodError::not_found(Self::NAME, name)),
        }
    }
}

async fn host() -> (Container, Arc<Scripts>) {
    let scripts_path = Path::new(WORKER_EXE).parent().unwrap().to_str().unwrap();
    let env = Environment::from_pairs([
        ("PATH", "/usr/bin:/bin"),
        ("MODHOST_SCRIPTS_PATH", scripts_path),
        ("MODHOST_STATUS_INTERVAL", "100ms"),
        ("MODHOST_LOG_LEVEL", "debug"),
    ]);
    let container = Container::with_environment("parent", env);
    container.register_module::<Scripts>().unwrap();
    container.register_callable_module::<Host>().unwrap();
    container.up(T).await.unwrap();
    let scripts = container.module::<Scripts>().unwrap();
    (container, scripts)
}

fn script(name: &str) -> WorkerOptions {
    WorkerOptions::default()
        .with_args([name])
        .with_stop_grace(Duration::from_secs(5))
}

async fn next<S: futures::Stream<Item = Value> + Unpin>(events: &mut S) -> Value {
    tokio::time::timeout(T, events.next())
        .await
        .expect("no event in time")
        .expect("event stream ended")
}

/// Waits for the first heartbeat: the worker is up and handles SIGTERM.
async fn attached(worker: &Worker) {
    let mut statuses = worker.listen(STATUS_EVENT);
    let status = next(&mut statuses).await;
    assert!(status["pid"].as_u64().is_some());
}

async fn stopped(worker: &Worker) -> WorkerStatus {
    tokio::time::timeout(T, worker.wait_for_state(WorkerState::Stopped))
        .await
        .expect("worker did not stop")
}

#[tokio::test]
async fn ping_is_answered_once_with_pong() {
    let (_container, scripts) = host().await;
    let worker = scripts.start_worker("pinger", "modhost-worker", script("ping")).unwrap();
    let mut ready = worker.listen("ready");
    let mut pongs = worker.listen("pong");

    next(&mut ready).await;
    worker.event("ping", json!(8)).unwrap();
    assert_eq!(next(&mut pongs).await, json!(16));

    let extra = tokio::time::timeout(Duration::from_millis(300), pongs.next()).await;
    assert!(extra.is_err(), "exactly one pong per ping");

    scripts.stop_worker("pinger").await.unwrap();
}

#[tokio::test]
async fn calls_stream_results_and_errors() {
    let (_container, scripts) = host().await;
    let worker = scripts.start_worker("calc", "modhost-worker", script("calc")).unwrap();
    worker.wait_for_state(WorkerState::Running).await;

    let values: Vec<Value> = worker
        .call("calc", "range", vec![json!(3)], CallOptions::default())
        .map(Result::unwrap)
        .collect()
        .await;
    assert_eq!(values, [json!(0), json!(1), json!(2)]);

    let doubled = worker
        .call_one("calc", "double", vec![json!(8)], CallOptions::default())
        .await
        .unwrap();
    assert!((doubled.as_f64().unwrap() - 16.0).abs() < f64::EPSILON);

    let err = worker
        .call_one("calc", "sqrt", vec![], CallOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.remote().unwrap().name, "method_not_found");

    let err = worker
        .call_one("calc", "fail", vec![], CallOptions::default())
        .await
        .unwrap_err();
    let remote = err.remote().unwrap();
    assert_eq!(remote.message, "evaluating expression");
    assert_eq!(remote.root_cause().message, "division by zero");

    let err = worker
        .call_one(
            "calc",
            "hang",
            vec![],
            CallOptions::with_timeout(Duration::from_millis(300)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Timeout { .. }));

    scripts.stop_worker("calc").await.unwrap();
}

#[tokio::test]
async fn workers_call_back_into_the_parent() {
    let (_container, scripts) = host().await;
    let worker = scripts.start_worker("relay", "modhost-worker", script("calc")).unwrap();
    worker.wait_for_state(WorkerState::Running).await;

    let greeting = worker
        .call_one(
            "calc",
            "ask",
            vec![json!("host"), json!("greet"), json!("bob")],
            CallOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(greeting, json!("hello bob"));

    let err = worker
        .call_one(
            "calc",
            "ask",
            vec![json!("nobody"), json!("greet")],
            CallOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(err.remote().unwrap().names().any(|n| n == "target_not_found"));

    scripts.stop_worker("relay").await.unwrap();
}

#[tokio::test]
async fn calls_sent_on_attach_are_served_with_callbacks_and_logs() {
    let (container, scripts) = host().await;
    let mut logs = container.subscribe_logs(LogLevel::Warning);
    let worker = scripts.start_worker("eager", "modhost-worker", script("calc")).unwrap();
    worker.wait_for_state(WorkerState::Running).await;

    // Both requests reach the worker while its container is still starting.
    let (greeting, logged) = tokio::join!(
        worker.call_one(
            "calc",
            "ask",
            vec![json!("host"), json!("greet"), json!("ann")],
            CallOptions::default(),
        ),
        worker.call_one(
            "calc",
            "log",
            vec![json!("error"), json!("first words")],
            CallOptions::default(),
        ),
    );
    assert_eq!(greeting.unwrap(), json!("hello ann"));
    logged.unwrap();

    let record = loop {
        let record = tokio::time::timeout(T, logs.next()).await.unwrap().unwrap();
        if record.source == "eager.calc" {
            break record;
        }
    };
    assert_eq!(record.message.to_string(), "first words");

    scripts.stop_worker("eager").await.unwrap();
}

#[tokio::test]
async fn worker_records_reach_parent_buses() {
    let (container, scripts) = host().await;
    let mut logs = container.subscribe_logs(LogLevel::Warning);
    let mut metrics = container.subscribe_metrics(&[]);
    let worker = scripts.start_worker("noisy", "modhost-worker", script("calc")).unwrap();
    worker.wait_for_state(WorkerState::Running).await;

    for (level, message) in [("debug", "chatter"), ("warning", "disk almost full")] {
        worker
            .call_one(
                "calc",
                "log",
                vec![json!(level), json!(message)],
                CallOptions::default(),
            )
            .await
            .unwrap();
    }
    let record = loop {
        let record = tokio::time::timeout(T, logs.next()).await.unwrap().unwrap();
        if record.source == "noisy.calc" {
            break record;
        }
    };
    assert_eq!(record.level, LogLevel::Warning);
    assert_eq!(record.message.to_string(), "disk almost full");

    worker
        .call_one("calc", "count", vec![json!("jobs")], CallOptions::default())
        .await
        .unwrap();
    let metric = loop {
        let metric = tokio::time::timeout(T, metrics.next()).await.unwrap().unwrap();
        if metric.name == "jobs" {
            break metric;
        }
    };
    assert_eq!(metric.source, "noisy.calc");

    scripts.stop_worker("noisy").await.unwrap();
}

#[tokio::test]
async fn cooperative_worker_stops_cleanly() {
    let (_container, scripts) = host().await;
    let worker = scripts.start_worker("idle", "modhost-worker", script("idle")).unwrap();
    attached(&worker).await;
    assert!(worker.status().pid.is_some());

    let exit = scripts.stop_worker("idle").await.unwrap();
    assert_eq!(exit.code, Some(0));
    assert_eq!(worker.status().restart_count, 0);

    let err = worker
        .call_one("calc", "double", vec![json!(1)], CallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::NotConnected));
}

#[tokio::test]
async fn stubborn_worker_is_killed_after_grace() {
    let (_container, scripts) = host().await;
    let options = script("stubborn").with_stop_grace(Duration::from_millis(500));
    let worker = scripts.start_worker("mule", "modhost-worker", options).unwrap();
    attached(&worker).await;

    let exit = scripts.stop_worker("mule").await.unwrap();
    assert_eq!(exit.code, None);
    assert_eq!(exit.signal.as_deref(), Some("SIGKILL"));
}

#[tokio::test]
async fn crashing_worker_is_restarted_up_to_the_limit() {
    let (_container, scripts) = host().await;
    let options = script("exit")
        .with_env("MODHOST_EXIT_CODE", "3")
        .with_restart_limit(2);
    let worker = scripts.start_worker("crasher", "modhost-worker", options).unwrap();

    let status = stopped(&worker).await;
    assert_eq!(status.restart_count, 2);
    assert_eq!(status.starts, 3);
    assert_eq!(status.last_exit.unwrap().code, Some(3));
}

#[tokio::test]
async fn long_running_worker_is_recycled() {
    let (_container, scripts) = host().await;
    let options = script("idle")
        .with_uptime_limit(Duration::from_millis(500))
        .with_restart_limit(1);
    let worker = scripts.start_worker("recycled", "modhost-worker", options).unwrap();

    let status = stopped(&worker).await;
    assert_eq!(status.restart_count, 1);
    assert_eq!(status.starts, 2);
    // Recycling terminates gracefully.
    assert!(status.last_exit.unwrap().is_clean());
}

#[tokio::test]
async fn parent_shutdown_stops_workers() {
    let (container, scripts) = host().await;
    let a = scripts.start_worker("a", "modhost-worker", script("idle")).unwrap();
    let b = scripts.start_worker("b", "modhost-worker", script("ping")).unwrap();
    attached(&a).await;
    attached(&b).await;

    tokio::time::timeout(T, container.down(T)).await.unwrap().unwrap();
    assert!(a.is_stopped());
    assert!(b.is_stopped());
    container.destroy();
}
