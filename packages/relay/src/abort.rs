//! Reusable cancellation handle shared between a session and its active run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// One-shot cancellation signal. A session holds one handle per run
/// generation; aborting signals every clone, and a fresh handle is issued
/// for subsequent runs.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    inner: Arc<AbortInner>,
}

#[derive(Debug)]
struct AbortInner {
    aborted: AtomicBool,
    notify: Notify,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AbortInner {
                aborted: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn abort(&self) {
        self.inner.aborted.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// True when both handles belong to the same run generation.
    pub fn same(&self, other: &AbortHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Resolves once `abort` has been called. Never resolves otherwise.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        loop {
            // Register before re-checking the flag so an abort between the
            // check and the await cannot be missed.
            notified.as_mut().enable();
            if self.is_aborted() {
                return;
            }
            notified.as_mut().await;
            notified.set(self.inner.notify.notified());
        }
    }
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn abort_wakes_waiters() {
        let handle = AbortHandle::new();
        let clone = handle.clone();
        let waiter = tokio::spawn(async move { clone.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.abort();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_returns_immediately_after_abort() {
        let handle = AbortHandle::new();
        handle.abort();
        assert!(handle.is_aborted());
        handle.cancelled().await;
    }
}
