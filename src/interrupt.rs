//! Cooperative cancellation shared between the agent loop and its transports
//!
//! One [`Interrupt`] instance is created per agent and cloned into whichever
//! transport is active, so every abort path observes the same flag. Reads
//! and writes use `SeqCst` so a cancel issued from another thread is visible
//! at the next check.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Sticky, clonable cancellation flag
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flag and wakes every task waiting in [`cancelled`](Self::cancelled)
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Re-arms the flag once the cancelled call has returned
    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// Resolves once the flag is set. Safe to race in `tokio::select!`.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}
