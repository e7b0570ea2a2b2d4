//! Cooperative shutdown signalling between the coordinator and its workers.
//!
//! One [`Broadcaster`] is held by `main`; each worker holds a cloned
//! [`Watcher`] and checks it once per loop iteration, which is its single
//! cancellation point.

use tokio::sync::watch;

/// Create a connected broadcaster/watcher pair.
#[must_use]
pub fn channel() -> (Broadcaster, Watcher) {
    let (tx, rx) = watch::channel(false);
    (Broadcaster { tx }, Watcher { rx })
}

/// Sends the one-shot shutdown signal.
#[derive(Debug)]
pub struct Broadcaster {
    tx: watch::Sender<bool>,
}

impl Broadcaster {
    /// Signal every watcher. Idempotent.
    pub fn signal(&self) {
        // Send only fails when every watcher is gone, which is fine: there
        // is nobody left to stop.
        let _ = self.tx.send(true);
    }
}

/// Receives the shutdown signal.
#[derive(Debug, Clone)]
pub struct Watcher {
    rx: watch::Receiver<bool>,
}

impl Watcher {
    /// Wait until shutdown is signalled.
    ///
    /// Resolves immediately on a signal already sent, and also when the
    /// broadcaster has been dropped without signalling, since no signal can
    /// arrive after that.
    pub async fn recv(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Non-blocking check, for workers between iterations.
    #[must_use]
    pub fn is_signalled(&self) -> bool {
        *self.rx.borrow()
    }
}
