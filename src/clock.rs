//! Monotonic millisecond clock.
//!
//! Every database handle owns one `MonotonicClock`. `now()` never returns a
//! value twice and never goes backwards, even when the wall clock does: the
//! result is always `max(last_issued + 1, wall_now)`, published through a
//! compare-and-swap loop so concurrent callers on any thread observe the
//! same discipline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch as reported by the OS.
pub(crate) fn wall_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug)]
pub struct MonotonicClock {
    last: AtomicU64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// Returns a strictly increasing millisecond timestamp.
    pub fn now(&self) -> u64 {
        let wall = wall_now_millis();
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let next = wall.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(observed) => last = observed,
            }
        }
    }

    /// The most recently issued timestamp, without advancing the clock.
    pub fn last_issued(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}
