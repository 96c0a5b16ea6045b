use std::fmt;

use tokio::signal;

/// Signal that ended the wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    CtrlC,
    Sigterm,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSignal::CtrlC => f.write_str("SIGINT"),
            ShutdownSignal::Sigterm => f.write_str("SIGTERM"),
        }
    }
}

/// Termination signal listeners.
///
/// SIGTERM is registered when `install` returns, not on first poll, so a
/// supervisor's SIGTERM sent right after startup is never lost to the default
/// disposition.
pub struct ShutdownSignals {
    #[cfg(unix)]
    sigterm: Option<signal::unix::Signal>,
}

impl ShutdownSignals {
    #[must_use]
    pub fn install() -> Self {
        #[cfg(unix)]
        {
            let sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
                .map_err(|e| {
                    tracing::error!(%e, "Failed to install SIGTERM handler");
                })
                .ok();
            Self { sigterm }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }

    /// Waits for Ctrl+C or SIGTERM.
    pub async fn recv(self) -> ShutdownSignal {
        let signal = tokio::select! {
            () = wait_ctrl_c() => ShutdownSignal::CtrlC,
            () = self.wait_sigterm() => ShutdownSignal::Sigterm,
        };
        tracing::info!(%signal, "Shutdown signal received, initiating graceful shutdown");
        signal
    }

    #[cfg(unix)]
    async fn wait_sigterm(self) {
        match self.sigterm {
            Some(mut sigterm) => {
                sigterm.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    #[cfg(not(unix))]
    async fn wait_sigterm(self) {
        std::future::pending::<()>().await;
    }
}

async fn wait_ctrl_c() {
    if let Err(e) = signal::ctrl_c().await {
        tracing::error!(%e, "Error handling Ctrl+C signal");
        std::future::pending::<()>().await;
    }
}

/// Wait for termination signals (Ctrl+C, SIGTERM).
pub async fn wait_for_shutdown() -> ShutdownSignal {
    ShutdownSignals::install().recv().await
}
