//! Cooperative shutdown signalling.
//!
//! A single [`ShutdownController`] is held by the binary; every long-running
//! task carries a cloned [`ShutdownToken`] and checks it between units of
//! work. Signalling is one-way and latched: once requested, every token
//! observes it, including tokens cloned afterwards.

use tokio::sync::watch;

/// Create a linked controller/token pair.
pub fn channel() -> (ShutdownController, ShutdownToken) {
    let (tx, rx) = watch::channel(false);
    (ShutdownController { tx }, ShutdownToken { rx })
}

/// Requests shutdown. Held by whoever owns the process lifecycle.
pub struct ShutdownController {
    tx: watch::Sender<bool>,
}

impl ShutdownController {
    /// Latch the shutdown request. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }

    /// A fresh token observing this controller.
    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observes a shutdown request. Cheap to clone, one per task.
#[derive(Clone)]
pub struct ShutdownToken {
    rx: watch::Receiver<bool>,
}

impl ShutdownToken {
    /// Whether shutdown has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is requested. A dropped controller counts as a
    /// request, so tasks never outlive the process lifecycle.
    pub async fn cancelled(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        while self.rx.changed().await.is_ok() {
            if *self.rx.borrow() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn token_observes_the_request() {
        let (controller, token) = channel();
        assert!(!token.is_cancelled());
        controller.shutdown();
        assert!(token.is_cancelled());
        assert!(controller.token().is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_resolves_after_request() {
        let (controller, mut token) = channel();
        let waiter = tokio::spawn(async move {
            token.cancelled().await;
        });
        controller.shutdown();
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resolve")
            .expect("waiter should not panic");
    }

    #[tokio::test]
    async fn dropped_controller_counts_as_a_request() {
        let (controller, mut token) = channel();
        drop(controller);
        timeout(Duration::from_secs(1), token.cancelled())
            .await
            .expect("token should resolve once the controller is gone");
    }
}
