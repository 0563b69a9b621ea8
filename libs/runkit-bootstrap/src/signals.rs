use std::fmt;

use anyhow::{Context, Result};
use tokio::signal;

/// Which termination request stopped the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSignal::Interrupt => f.write_str("SIGINT"),
            ShutdownSignal::Terminate => f.write_str("SIGTERM"),
        }
    }
}

/// Wait for Ctrl+C or SIGTERM and report which one arrived.
pub async fn wait_for_shutdown() -> Result<ShutdownSignal> {
    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    #[cfg(unix)]
    let terminated = async move {
        terminate.recv().await;
    };

    #[cfg(not(unix))]
    let terminated = std::future::pending::<()>();

    let received = tokio::select! {
        result = signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            ShutdownSignal::Interrupt
        }
        _ = terminated => ShutdownSignal::Terminate,
    };

    tracing::info!(signal = %received, "Shutdown signal received");
    Ok(received)
}
