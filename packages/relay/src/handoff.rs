//! Handoff channel for injecting follow-up user input into an in-progress
//! agent run.
//!
//! The consuming run loop awaits `next()`; user messages arriving while the
//! run is busy are `push`ed here and delivered as additional user turns.
//! `close()` marks the channel terminal and wakes every parked consumer with
//! end-of-stream. `drain()` recovers anything pushed but never consumed so
//! teardown can re-queue it instead of silently dropping input.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

#[derive(Debug)]
struct HandoffInner {
    buffer: VecDeque<String>,
    closed: bool,
}

/// FIFO, at-most-once-per-value, single-use for the lifetime of one run.
#[derive(Debug)]
pub struct HandoffChannel {
    inner: Mutex<HandoffInner>,
    notify: Notify,
}

impl HandoffChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HandoffInner {
                buffer: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        })
    }

    /// Enqueue a value. Returns false if the channel is already closed, in
    /// which case the value was not accepted and the caller must queue it
    /// elsewhere.
    pub async fn push(&self, value: String) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return false;
        }
        inner.buffer.push_back(value);
        self.notify.notify_one();
        true
    }

    /// Idempotent. After close, `next()` yields only end-of-stream and
    /// `push` is rejected.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return;
        }
        inner.closed = true;
        drop(inner);
        self.notify.notify_waiters();
        // A consumer racing between its emptiness check and parking needs a
        // stored permit to observe the close.
        self.notify.notify_one();
    }

    pub async fn is_open(&self) -> bool {
        !self.inner.lock().await.closed
    }

    /// Next pushed value in FIFO order, or `None` once the channel is closed
    /// and the buffer exhausted.
    pub async fn next(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().await;
                if let Some(value) = inner.buffer.pop_front() {
                    return Some(value);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Atomically remove and return everything buffered but not yet
    /// consumed. Used during teardown to rescue input that arrived after the
    /// run stopped reading.
    pub async fn drain(&self) -> Vec<String> {
        let mut inner = self.inner.lock().await;
        inner.buffer.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn delivers_in_push_order_then_end_of_stream() {
        let channel = HandoffChannel::new();
        assert!(channel.push("a".to_string()).await);
        assert!(channel.push("b".to_string()).await);
        channel.close().await;

        assert_eq!(channel.next().await.as_deref(), Some("a"));
        assert_eq!(channel.next().await.as_deref(), Some("b"));
        assert_eq!(channel.next().await, None);
        assert_eq!(channel.next().await, None);
    }

    #[tokio::test]
    async fn push_wakes_parked_consumer() {
        let channel = HandoffChannel::new();
        let consumer = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.next().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(channel.push("live".to_string()).await);
        let value = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer should wake")
            .unwrap();
        assert_eq!(value.as_deref(), Some("live"));
    }

    #[tokio::test]
    async fn close_wakes_parked_consumer() {
        let channel = HandoffChannel::new();
        let consumer = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.next().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.close().await;
        let value = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer should wake")
            .unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn push_after_close_is_rejected() {
        let channel = HandoffChannel::new();
        channel.close().await;
        channel.close().await;
        assert!(!channel.push("late".to_string()).await);
        assert!(!channel.is_open().await);
    }

    #[tokio::test]
    async fn drain_returns_only_unconsumed_values() {
        let channel = HandoffChannel::new();
        for value in ["a", "b", "c"] {
            assert!(channel.push(value.to_string()).await);
        }
        assert_eq!(channel.next().await.as_deref(), Some("a"));
        channel.close().await;
        assert_eq!(channel.drain().await, vec!["b", "c"]);
        assert!(channel.drain().await.is_empty());
        assert_eq!(channel.next().await, None);
    }
}
