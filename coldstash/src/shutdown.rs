//! Cancellation on SIGINT and SIGTERM.
//!
//! A signal cancels the shared token; retry waits, poll sleeps and the
//! pipelines' stage boundaries observe it and stop without leaving partial
//! files under their final names.

use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token handed to the pipelines.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancel the token on the first SIGINT or SIGTERM.
    pub fn listen(&self) -> JoinHandle<()> {
        let token = self.token.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            token.cancel();
        })
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), stopping after the current step...");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping after the current step...");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancelling_one_token_reaches_every_clone() {
        let coordinator = ShutdownCoordinator::new();
        let token = coordinator.token();

        let handle = tokio::spawn(async move {
            token.cancelled().await;
        });

        coordinator.token().cancel();
        handle.await.unwrap();
        assert!(coordinator.token().is_cancelled());
    }
}
