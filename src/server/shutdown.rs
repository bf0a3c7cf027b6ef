//! Cooperative cancellation.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

/// The receiving side of the server's cancellation signal.
///
/// Cheap to clone. The dispatch loop watches it to start draining, and every
/// handler and middleware receives a copy so long-running work can stop
/// early. Ignoring it is allowed but delays shutdown until the work returns.
///
/// # Examples
///
/// ```rust
/// use switchyard::server::Shutdown;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let (trigger, shutdown) = Shutdown::new();
/// assert!(!shutdown.is_cancelled());
///
/// trigger.cancel();
/// shutdown.cancelled().await;
/// assert!(shutdown.is_cancelled());
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

/// Raises the signal observed by the paired [`Shutdown`]s.
///
/// Dropping every trigger without calling [`cancel`](Self::cancel) leaves the
/// signal unraised forever.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    /// Creates a connected trigger/signal pair.
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (ShutdownTrigger, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (ShutdownTrigger { tx: Arc::new(tx) }, Shutdown { rx })
    }

    /// A signal that is never raised.
    pub fn never() -> Self {
        Self::new().1
    }

    /// Returns `true` once the signal has been raised.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes once the signal is raised. Never completes if it never is.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            // Every trigger dropped without cancelling.
            std::future::pending::<()>().await;
        }
    }
}

impl ShutdownTrigger {
    /// Raises the signal. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Returns a [`Shutdown`] raised on the first Ctrl+C.
///
/// Must be called inside a Tokio runtime. If the signal handler cannot be
/// installed, the error is logged and the returned signal is never raised.
pub fn shutdown_on_ctrl_c() -> Shutdown {
    let (trigger, shutdown) = Shutdown::new();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown signal received");
                trigger.cancel();
            }
            Err(e) => error!(error = %e, "failed to install Ctrl+C handler"),
        }
    });
    shutdown
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn cancel_wakes_every_clone() {
        let (trigger, shutdown) = Shutdown::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let shutdown = shutdown.clone();
                tokio::spawn(async move { shutdown.cancelled().await })
            })
            .collect();

        trigger.cancel();
        for waiter in waiters {
            waiter.await.unwrap();
        }
        assert!(trigger.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_sticky() {
        let (trigger, shutdown) = Shutdown::new();
        trigger.cancel();
        trigger.cancel();
        // A clone taken after cancellation still sees it.
        shutdown.clone().cancelled().await;
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn never_is_never_cancelled() {
        let shutdown = Shutdown::never();
        assert!(!shutdown.is_cancelled());
        let waited = tokio::time::timeout(Duration::from_millis(20), shutdown.cancelled()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn dropped_trigger_does_not_cancel() {
        let (trigger, shutdown) = Shutdown::new();
        drop(trigger);
        let waited = tokio::time::timeout(Duration::from_millis(20), shutdown.cancelled()).await;
        assert!(waited.is_err());
        assert!(!shutdown.is_cancelled());
    }
}
