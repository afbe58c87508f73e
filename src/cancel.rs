//! Cooperative cancellation shared across a debate.
//!
//! A single token is created per debate and handed to every downstream
//! call (agent invocations, research hooks, storage waits). Receivers
//! check `is_canceled()` at suspension points or `select!` against
//! `canceled()` for long awaits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Shared cancellation signal that tasks check at suspension points.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    canceled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    /// Create a new non-canceled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation. Idempotent; wakes every waiter.
    pub fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Whether cancellation has been requested.
    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::Acquire)
    }

    /// Resolve when cancellation is signaled. Completes immediately if
    /// the token is already canceled.
    pub async fn canceled(&self) {
        if self.is_canceled() {
            return;
        }
        loop {
            let notified = self.inner.notify.notified();
            if self.is_canceled() {
                return;
            }
            notified.await;
            if self.is_canceled() {
                return;
            }
        }
    }
}
