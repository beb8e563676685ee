//! Shutdown signalling
//!
//! Every background loop selects between its work source and a [`ShutdownSignal`].
//! The owner keeps the [`Shutdown`] handle and triggers it once; dropping the
//! handle also releases all waiters.

use tokio::sync::watch;

/// Owning side of a shutdown signal
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Trigger shutdown for every signal created from this handle
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn to_signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of a shutdown signal, cheap to clone
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is triggered or the [`Shutdown`] handle is dropped
    pub async fn wait(&mut self) {
        // An error means the sender is gone, which is a shutdown as well
        let _ = self.rx.wait_for(|triggered| *triggered).await;
    }
}
