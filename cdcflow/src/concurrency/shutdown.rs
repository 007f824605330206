use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Sending side of the pipeline shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownTx(Arc<watch::Sender<bool>>);

impl ShutdownTx {
    /// Signals shutdown to every current and future subscriber.
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }

    pub fn subscribe(&self) -> ShutdownRx {
        ShutdownRx(self.0.subscribe())
    }

    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }
}

/// Receiving side of the pipeline shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownRx(watch::Receiver<bool>);

impl ShutdownRx {
    /// Resolves once shutdown was requested, immediately if it already was.
    ///
    /// Also resolves when the sender is dropped, which only happens when the pipeline
    /// itself is gone.
    pub async fn wait(&mut self) {
        let _ = self.0.wait_for(|shutdown| *shutdown).await;
    }

    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    /// Sleeps for `duration` unless shutdown is requested first.
    ///
    /// Returns `false` when the sleep was cut short by shutdown.
    pub async fn sleep_unless_shutdown(&mut self, duration: Duration) -> bool {
        tokio::select! {
            biased;

            _ = self.wait() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTx(Arc::new(tx)), ShutdownRx(rx))
}
