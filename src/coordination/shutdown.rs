//! Shutdown coordination
//!
//! A single [`ShutdownSignal`] is owned by the service context. Long-lived tasks
//! hold a [`ShutdownToken`] and select on [`ShutdownToken::cancelled`] at every
//! suspension point that must be cancellable.

use tokio::sync::watch;
use tracing::{info, warn};

/// Process-wide shutdown trigger
pub struct ShutdownSignal {
    tx: watch::Sender<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn trigger(&self, reason: &str) {
        let already = self.tx.send_replace(true);
        if !already {
            info!(reason = %reason, "Shutdown requested");
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable handle for observing shutdown from tasks
#[derive(Clone)]
pub struct ShutdownToken {
    rx: watch::Receiver<bool>,
}

impl ShutdownToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been triggered (or the signal was dropped)
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Wait for Ctrl-C or SIGTERM
pub async fn wait_for_os_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
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
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_token_observes_trigger() {
        let signal = ShutdownSignal::new();
        let mut token = signal.token();
        assert!(!token.is_cancelled());

        let waiter = tokio::spawn(async move {
            token.cancelled().await;
        });

        signal.trigger("test");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("token resolves")
            .unwrap();
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn test_token_created_after_trigger_resolves_immediately() {
        let signal = ShutdownSignal::new();
        signal.trigger("early");
        let mut token = signal.token();
        assert!(token.is_cancelled());
        token.cancelled().await;
    }
}
