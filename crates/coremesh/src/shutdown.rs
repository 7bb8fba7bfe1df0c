//! External cancellation signal.
//!
//! A [`ShutdownTrigger`] is held by whoever decides to stop the run (the CLI
//! wires it to Ctrl-C). The controller observes the paired [`ShutdownSignal`].

use tokio::sync::watch;

/// Sending half: request shutdown.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    /// Request shutdown. Repeated calls are harmless.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

/// Receiving half: wait until shutdown is requested.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Create a connected trigger/signal pair.
    #[must_use]
    pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (ShutdownTrigger { tx }, ShutdownSignal { rx })
    }

    /// A signal that never fires.
    #[must_use]
    pub fn never() -> Self {
        let (_trigger, signal) = Self::channel();
        signal
    }

    /// Whether shutdown has already been requested.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is requested.
    ///
    /// If the trigger is dropped without firing, this never resolves.
    pub async fn requested(&mut self) {
        if self.rx.wait_for(|requested| *requested).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
