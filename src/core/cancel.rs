//! Cooperative cancellation.
//!
//! Lock polling, retry sleeps, and health-check tickers are the core's
//! suspension points; each observes a [`CancelToken`] so a shutdown request
//! interrupts the wait instead of the sleep running to completion. Holding
//! the transaction lock across a cancellation is safe: the guard releases on
//! drop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Cheap, cloneable cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep up to `duration`, waking early on cancellation. Returns `false`
    /// if cancelled before the full duration elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            if self.is_cancelled() {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            std::thread::sleep(remaining.min(Duration::from_millis(20)));
        }
        !self.is_cancelled()
    }
}
