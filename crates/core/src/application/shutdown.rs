// Shutdown Token

use std::fmt;
use std::future::Future;
use tokio::sync::watch;
use tracing::{error, info};

/// Shutdown signal for graceful termination
#[derive(Clone)]
pub struct ShutdownToken {
    rx: watch::Receiver<bool>,
}

impl ShutdownToken {
    /// Check if shutdown was requested
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait for shutdown signal (returns immediately if already requested)
    pub async fn wait(&mut self) {
        if self.rx.wait_for(|requested| *requested).await.is_err() {
            // Sender gone without a request: nobody can ask us to stop anymore
            std::future::pending::<()>().await;
        }
    }
}

/// Shutdown sender
pub struct ShutdownSender {
    tx: watch::Sender<bool>,
}

impl ShutdownSender {
    /// Signal shutdown to every token holder
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }

    /// Request shutdown once `signal` fires
    ///
    /// A listener that fails to install leaves shutdown untriggered; the
    /// process keeps running until its work ends on its own.
    pub async fn shutdown_on<F, E>(self, signal: F)
    where
        F: Future<Output = std::result::Result<(), E>>,
        E: fmt::Display,
    {
        match signal.await {
            Ok(()) => {
                info!("Shutdown signal received");
                self.shutdown();
            }
            Err(e) => error!(error = %e, "Failed to listen for shutdown signals"),
        }
    }
}

/// Create a shutdown channel
pub fn shutdown_channel() -> (ShutdownSender, ShutdownToken) {
    let (tx, rx) = watch::channel(false);
    (ShutdownSender { tx }, ShutdownToken { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_returns_after_shutdown() {
        let (tx, mut token) = shutdown_channel();
        assert!(!token.is_shutdown());

        tx.shutdown();
        tokio::time::timeout(Duration::from_millis(100), token.wait())
            .await
            .expect("wait should return once shutdown was requested");
        assert!(token.is_shutdown());
    }

    #[tokio::test]
    async fn test_signal_triggers_shutdown() {
        let (tx, mut token) = shutdown_channel();

        tx.shutdown_on(async { Ok::<(), std::io::Error>(()) }).await;
        tokio::time::timeout(Duration::from_millis(100), token.wait())
            .await
            .expect("signal should request shutdown");
    }

    #[tokio::test]
    async fn test_failed_signal_listener_keeps_running() {
        let (tx, mut token) = shutdown_channel();

        tx.shutdown_on(async {
            Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "no signal driver"))
        })
        .await;

        let waited = tokio::time::timeout(Duration::from_millis(50), token.wait()).await;
        assert!(waited.is_err());
        assert!(!token.is_shutdown());
    }

    #[tokio::test]
    async fn test_dropped_sender_does_not_trigger_shutdown() {
        let (tx, mut token) = shutdown_channel();
        drop(tx);

        let waited = tokio::time::timeout(Duration::from_millis(50), token.wait()).await;
        assert!(waited.is_err());
    }
}
