//! Host runner.
//!
//! Phase order: **build → up → wait → down → destroy**.
//! A failed `up` does not roll back by itself; the runner follows it with a
//! best-effort `down` so the modules that did start are stopped, then destroys
//! the container and returns the original error.
//!
//! Shutdown can be driven by OS signals, an external `CancellationToken`, or an
//! arbitrary future.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::HostConfig;
use crate::container::Container;
use crate::runtime::shutdown::ShutdownSignals;

/// How the runner should decide when to stop.
pub enum ShutdownOptions {
    /// Listen for OS signals (Ctrl+C / SIGTERM).
    Signals,
    /// An external `CancellationToken` controls the lifecycle.
    Token(CancellationToken),
    /// An arbitrary future; when it completes, shutdown starts.
    Future(Pin<Box<dyn Future<Output = ()> + Send>>),
}

pub struct RunOptions {
    pub up_timeout: Duration,
    pub down_timeout: Duration,
    pub shutdown: ShutdownOptions,
}

impl RunOptions {
    #[must_use]
    pub fn from_config(cfg: &HostConfig, shutdown: ShutdownOptions) -> Self {
        Self {
            up_timeout: cfg.up_timeout,
            down_timeout: cfg.down_timeout,
            shutdown,
        }
    }
}

/// Full cycle for `container`.
///
/// # Errors
/// The build or `up` failure, otherwise the `down` failure.
pub async fn run(container: &Container, opts: RunOptions) -> anyhow::Result<()> {
    let cancel = match &opts.shutdown {
        ShutdownOptions::Token(t) => t.clone(),
        _ => CancellationToken::new(),
    };

    match opts.shutdown {
        ShutdownOptions::Signals => {
            let signals = ShutdownSignals::install();
            let c = cancel.clone();
            tokio::spawn(async move {
                signals.recv().await;
                c.cancel();
            });
        }
        ShutdownOptions::Future(waiter) => {
            let c = cancel.clone();
            tokio::spawn(async move {
                waiter.await;
                tracing::info!("shutdown: external future completed");
                c.cancel();
            });
        }
        ShutdownOptions::Token(_) => {
            tracing::info!("shutdown: external token will control lifecycle");
        }
    }

    tracing::info!(container = container.name(), "Phase: build");
    if let Err(err) = container.build() {
        container.destroy();
        return Err(err.into());
    }

    if let Err(err) = container.up(opts.up_timeout).await {
        if let Err(down_err) = container.down(opts.down_timeout).await {
            tracing::warn!(error = %down_err, "down after failed up did not complete");
        }
        container.destroy();
        return Err(err.into());
    }

    cancel.cancelled().await;

    let result = container.down(opts.down_timeout).await;
    container.destroy();
    result.map_err(Into::into)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::contracts::{Module, ModuleFactory};
    use crate::context::ModuleCtx;
    use crate::deps::Resolved;
    use crate::environment::Environment;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static UPS: AtomicUsize = AtomicUsize::new(0);
    static DOWNS: AtomicUsize = AtomicUsize::new(0);

    struct Counter;

    #[async_trait::async_trait]
    impl Module for Counter {
        async fn up(&self) -> anyhow::Result<()> {
            UPS.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn down(&self) -> anyhow::Result<()> {
            DOWNS.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl ModuleFactory for Counter {
        const NAME: &'static str = "counter";
        fn build(_ctx: ModuleCtx, _deps: &Resolved) -> anyhow::Result<Self> {
            Ok(Counter)
        }
    }

    struct Broken;

    #[async_trait::async_trait]
    impl Module for Broken {
        async fn up(&self) -> anyhow::Result<()> {
            anyhow::bail!("refusing to start")
        }
    }

    impl ModuleFactory for Broken {
        const NAME: &'static str = "broken";
        fn build(_ctx: ModuleCtx, _deps: &Resolved) -> anyhow::Result<Self> {
            Ok(Broken)
        }
    }

    fn opts(shutdown: ShutdownOptions) -> RunOptions {
        RunOptions {
            up_timeout: Duration::from_secs(5),
            down_timeout: Duration::from_secs(5),
            shutdown,
        }
    }

    #[tokio::test]
    async fn token_drives_full_cycle() {
        let container = Container::with_environment("runner", Environment::new());
        container.register_module::<Counter>().unwrap();
        let token = CancellationToken::new();

        let runner = {
            let container = container.clone();
            let token = token.clone();
            tokio::spawn(async move { run(&container, opts(ShutdownOptions::Token(token))).await })
        };

        let mut states = container.state_changes();
        states.wait_for(|t| t.is_up("counter")).await.unwrap();
        token.cancel();
        runner.await.unwrap().unwrap();

        assert_eq!(UPS.load(Ordering::SeqCst), 1);
        assert_eq!(DOWNS.load(Ordering::SeqCst), 1);
        assert!(container.cancellation_token().is_cancelled());
    }

    #[tokio::test]
    async fn failed_up_stops_started_modules() {
        let container = Container::with_environment("runner", Environment::new());
        container.register_module::<Broken>().unwrap();
        let err = run(&container, opts(ShutdownOptions::Future(Box::pin(std::future::pending()))))
            .await
            .unwrap_err();
        let err = err.downcast::<crate::ContainerError>().unwrap();
        assert_eq!(err.as_label(), "hook_failed");
        assert!(container.states().all_down());
    }
}
