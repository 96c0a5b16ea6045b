mod scripts;

use anyhow::Result;
use clap::Parser;
use futures::FutureExt;
use modhost::logging::{init_logging, spawn_log_bridge};
use modhost::runtime::{RunOptions, ShutdownOptions, ShutdownSignals, run};
use modhost::{Container, Environment, HostConfig};
use modhost_ipc::ChildProcess;

use crate::scripts::Script;

/// `ModHost` worker - hosts one built-in script in a child container
#[derive(Parser)]
#[command(name = "modhost-worker")]
#[command(about = "ModHost worker - hosts one built-in script in a child container")]
#[command(version)]
struct Cli {
    /// Script to host
    #[arg(value_enum)]
    script: Script,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    // Registered before anything else; the supervisor may terminate us early.
    let signals = ShutdownSignals::install();

    let code = match host(cli.script, signals).await {
        Ok(()) => 0,
        Err(err) => {
            tracing::error!(error = format!("{err:#}"), "Worker failed");
            1
        }
    };
    // stdin reads block runtime shutdown; leave without dropping it.
    std::process::exit(code);
}

async fn host(script: Script, signals: ShutdownSignals) -> Result<()> {
    let environment = Environment::from_process();
    let config = HostConfig::load(&environment)?;
    init_logging(&config);
    tracing::info!(
        %script,
        worker = config.worker_name.as_deref().unwrap_or("-"),
        "Worker starting"
    );

    let container = Container::with_environment(config.name.clone(), environment);
    // Attached workers forward bus records to the parent instead.
    if !config.is_worker() {
        spawn_log_bridge(&container, config.log_threshold());
    }

    container.register_module::<ChildProcess>()?;
    script.register(&container)?;
    container.build()?;
    let disconnected = container.module::<ChildProcess>()?.disconnected();

    let shutdown = if script.honors_shutdown() {
        async move {
            tokio::select! {
                _ = signals.recv() => {}
                () = disconnected.cancelled() => {
                    tracing::info!("Parent went away, shutting down");
                }
            }
        }
        .boxed()
    } else {
        async move {
            let _signals = signals;
            tracing::info!("Ignoring termination requests");
            std::future::pending::<()>().await;
        }
        .boxed()
    };

    run(
        &container,
        RunOptions::from_config(&config, ShutdownOptions::Future(shutdown)),
    )
    .await
}
