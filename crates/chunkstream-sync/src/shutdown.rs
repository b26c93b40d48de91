//! One-shot cancellation broadcast.
//!
//! A [`Shutdown`] is held by the owner of some work; every task doing that
//! work holds a [`ShutdownSignal`]. Triggering the shutdown, or dropping it,
//! resolves every signal.

use tokio::sync::watch;

#[derive(Debug)]
pub struct Shutdown(watch::Sender<bool>);

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self(tx)
    }

    pub fn trigger(&self) {
        self.0.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    pub fn to_signal(&self) -> ShutdownSignal {
        ShutdownSignal(self.0.subscribe())
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownSignal(watch::Receiver<bool>);

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.0.borrow() || self.0.has_changed().is_err()
    }

    /// Wait until the shutdown is triggered or its owner is dropped.
    pub async fn wait(&mut self) {
        // Err means the sender is gone, which counts as shutdown.
        let _ = self.0.wait_for(|triggered| *triggered).await;
    }
}
