//! Per-dispatch cancellation token.
//!
//! The flag is a single `AtomicBool` that only ever moves from `false` to
//! `true`. The caller side writes it; the running operation reads it at its
//! checkpoints. A `Notify` wakes operations that are parked in
//! [`CancellationToken::cancelled`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Returned by a checkpoint once cancellation has been requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Shared, thread-safe cancellation flag. Cloning shares the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Idempotent; returns `true` only for the call that
    /// flipped the flag.
    pub fn cancel(&self) -> bool {
        let flipped = !self.inner.cancelled.swap(true, Ordering::AcqRel);
        if flipped {
            self.inner.notify.notify_waiters();
        }
        flipped
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Polls the flag.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` once cancellation has been requested.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        loop {
            // Register before re-checking the flag so a concurrent `cancel()`
            // cannot slip between the check and the wait.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Returns true if both handles share the same flag.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
