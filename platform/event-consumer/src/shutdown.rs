//! Signal-driven shutdown
//!
//! SIGTERM/SIGINT cancel a [`CancellationToken`] shared by the consumer
//! runtime, the cleanup task and the service's HTTP server.

use std::fmt;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Sigterm,
    Sigint,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSignal::Sigterm => write!(f, "SIGTERM"),
            ShutdownSignal::Sigint => write!(f, "SIGINT"),
        }
    }
}

/// Wait for the first shutdown signal. Returns `None` if no handler could be installed.
pub async fn wait_for_signal() -> Option<ShutdownSignal> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                return None;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Failed to install SIGINT handler");
                return None;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => Some(ShutdownSignal::Sigterm),
            _ = sigint.recv() => Some(ShutdownSignal::Sigint),
        }
    }

    #[cfg(not(unix))]
    {
        match tokio::signal::ctrl_c().await {
            Ok(()) => Some(ShutdownSignal::Sigint),
            Err(e) => {
                error!(error = %e, "Failed to listen for Ctrl+C");
                None
            }
        }
    }
}

/// Cancel `token` on the first SIGTERM/SIGINT
pub fn cancel_on_signal(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            signal = wait_for_signal() => {
                if let Some(signal) = signal {
                    info!(signal = %signal, "Initiating graceful shutdown");
                    token.cancel();
                }
            }
            _ = token.cancelled() => {}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signal_task_exits_when_token_cancelled_elsewhere() {
        let token = CancellationToken::new();
        let handle = cancel_on_signal(token.clone());
        token.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_signal_display() {
        assert_eq!(ShutdownSignal::Sigterm.to_string(), "SIGTERM");
        assert_eq!(ShutdownSignal::Sigint.to_string(), "SIGINT");
    }
}
