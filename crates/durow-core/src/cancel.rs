//! Explicit cancellation tokens for long-running loops.
//!
//! A `CancelHandle`/`CancelToken` pair replaces a shared "running" flag: the
//! owner signals through the handle, and each loop checks its token at every
//! suspension point. Tokens are cheap to clone and safe to pass into spawned
//! tasks and sandbox executions.

use tokio::sync::watch;

/// Signalling side of a cancellation pair.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Observing side of a cancellation pair.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is signalled. If the handle is dropped
    /// without cancelling, this pends forever (the loop ends on its own).
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        std::future::pending::<()>().await;
    }

    /// A token that is never cancelled, for one-shot callers.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }
}

/// Create a connected handle/token pair.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}
