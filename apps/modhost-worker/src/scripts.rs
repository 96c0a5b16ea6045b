//! Built-in scripts a worker can host.
//!
//! | script     | behavior                                                        |
//! |------------|-----------------------------------------------------------------|
//! | `idle`     | nothing; runs until terminated or detached                      |
//! | `ping`     | answers each `ping` event with `pong` carrying twice the number |
//! | `calc`     | callable `calc` module, including calls back into the parent    |
//! | `exit`     | exits abruptly with `MODHOST_EXIT_CODE` after `MODHOST_EXIT_AFTER` |
//! | `stubborn` | ignores termination requests                                    |

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::ValueEnum;
use futures::StreamExt;
use modhost::contracts::{method, number_arg};
use modhost::{
    CallableModule, Container, ContainerError, Dependencies, LogLevel, MethodError, MethodStream,
    Module, ModuleCtx, ModuleFactory, Resolved, async_trait,
};
use modhost_ipc::{CallOptions, ChildProcess};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::task::JoinHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Script {
    Idle,
    Ping,
    Calc,
    Exit,
    Stubborn,
}

impl Script {
    /// Registers the script's modules next to the already registered
    /// [`ChildProcess`].
    pub fn register(self, container: &Container) -> Result<(), ContainerError> {
        match self {
            Script::Idle | Script::Stubborn => Ok(()),
            Script::Ping => container.register_module::<Ping>(),
            Script::Calc => container.register_callable_module::<Calc>(),
            Script::Exit => container.register_module::<Exit>(),
        }
    }

    #[must_use]
    pub fn honors_shutdown(self) -> bool {
        self != Script::Stubborn
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Script::Idle => "idle",
            Script::Ping => "ping",
            Script::Calc => "calc",
            Script::Exit => "exit",
            Script::Stubborn => "stubborn",
        };
        f.write_str(name)
    }
}

/// Echo service over events.
pub struct Ping {
    child: Arc<ChildProcess>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Module for Ping {
    async fn up(&self) -> anyhow::Result<()> {
        if !self.child.is_worker() {
            tracing::warn!("ping script is detached; nothing to answer");
            return Ok(());
        }
        let mut pings = self.child.listen("ping");
        let child = self.child.clone();
        let task = tokio::spawn(async move {
            while let Some(data) = pings.next().await {
                let reply = data.as_i64().map_or(Value::Null, |n| json!(n.saturating_mul(2)));
                if child.event("pong", reply).is_err() {
                    break;
                }
            }
        });
        *self.task.lock() = Some(task);
        self.child.event("ready", Value::Null)?;
        Ok(())
    }

    fn destroy(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl ModuleFactory for Ping {
    const NAME: &'static str = "ping";

    fn dependencies() -> Dependencies {
        Dependencies::new().with::<ChildProcess>()
    }

    fn build(_ctx: ModuleCtx, deps: &Resolved) -> anyhow::Result<Self> {
        Ok(Self {
            child: deps.get::<ChildProcess>()?,
            task: Mutex::new(None),
        })
    }
}

/// Arithmetic and diagnostics methods reachable from the parent.
pub struct Calc {
    ctx: ModuleCtx,
    child: Arc<ChildProcess>,
}

#[async_trait]
impl Module for Calc {}

impl ModuleFactory for Calc {
    const NAME: &'static str = "calc";

    fn dependencies() -> Dependencies {
        Dependencies::new().with::<ChildProcess>()
    }

    fn build(ctx: ModuleCtx, deps: &Resolved) -> anyhow::Result<Self> {
        Ok(Self {
            ctx,
            child: deps.get::<ChildProcess>()?,
        })
    }
}

impl CallableModule for Calc {
    fn call(&self, name: &str, args: Vec<Value>) -> Result<MethodStream, MethodError> {
        match name {
            "double" => {
                let n = number_arg(name, &args, 0)?;
                Ok(method::value(json!(n * 2.0)))
            }
            "range" => {
                let n = args
                    .first()
                    .and_then(Value::as_u64)
                    .ok_or_else(|| MethodError::invalid_arguments(name, "expected a count"))?;
                Ok(method::values((0..n).map(Value::from)))
            }
            "hang" => Ok(method::pending()),
            "fail" => Ok(method::error(
                anyhow::anyhow!("division by zero").context("evaluating expression"),
            )),
            "log" => {
                let (level, message) = string_pair(name, &args)?;
                let level: LogLevel = level
                    .parse()
                    .map_err(|_| MethodError::invalid_arguments(name, "unknown log level"))?;
                self.ctx.log().log(level, message);
                Ok(method::value(Value::Null))
            }
            "count" => {
                let metric = args
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| MethodError::invalid_arguments(name, "expected a metric name"))?;
                self.ctx.metric().increment(metric);
                Ok(method::value(Value::Null))
            }
            // `ask(target, method, args...)` relays a call to the parent.
            "ask" => {
                let (target, remote) = string_pair(name, &args)?;
                let rest = args.into_iter().skip(2).collect();
                let replies = self
                    .child
                    .call(target, remote, rest, CallOptions::default())
                    .map(|reply| reply.map_err(anyhow::Error::new));
                Ok(replies.boxed())
            }
            _ => Err(MethodError::not_found(Self::NAME, name)),
        }
    }
}

fn string_pair(name: &str, args: &[Value]) -> Result<(String, String), MethodError> {
    match args {
        [Value::String(a), Value::String(b), ..] => Ok((a.clone(), b.clone())),
        _ => Err(MethodError::invalid_arguments(name, "expected two strings")),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ExitConfig {
    code: String,
    #[serde(with = "modhost_utils::duration")]
    after: Duration,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            code: "1".to_owned(),
            after: Duration::from_millis(100),
        }
    }
}

/// Simulates a crash: leaves the process without bringing the container down.
pub struct Exit {
    code: i32,
    after: Duration,
}

#[async_trait]
impl Module for Exit {
    async fn up(&self) -> anyhow::Result<()> {
        let (code, after) = (self.code, self.after);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            tracing::warn!(code, "Exiting abruptly");
            std::process::exit(code);
        });
        Ok(())
    }
}

impl ModuleFactory for Exit {
    const NAME: &'static str = "exit";

    fn build(ctx: ModuleCtx, _deps: &Resolved) -> anyhow::Result<Self> {
        let cfg: ExitConfig = ctx.config("exit")?;
        let code = cfg
            .code
            .parse()
            .with_context(|| format!("MODHOST_EXIT_CODE is not an integer: {}", cfg.code))?;
        Ok(Self {
            code,
            after: cfg.after,
        })
    }
}
