//! In-process cooperative lock table.
//!
//! Locks are advisory and purely process-local: holders and waiters are
//! cooperating callers of one database handle. A refused `try_lock` may
//! leave a callback that fires when the holder releases; `with_lock`
//! blocks instead, waking on release or failing when the database closes
//! mid-wait. The lock is released on every exit path of the body,
//! panics included.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use scopeguard::defer;
use tracing::trace;

use crate::error::{Error, Result};

/// Invoked once when the awaited key is released.
pub type ReleaseCallback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct LockEntry {
    waiters: Vec<ReleaseCallback>,
}

/// The per-database lock table.
#[derive(Default)]
pub(crate) struct LockTable {
    inner: Mutex<HashMap<Vec<u8>, LockEntry>>,
    released: Condvar,
}

impl std::fmt::Debug for LockTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockTable")
            .field("held", &self.inner.lock().len())
            .finish()
    }
}

impl LockTable {
    /// Attempts to take `key`. On refusal, registers `on_release` (if any)
    /// with the current holder and returns false.
    pub fn try_lock(&self, key: &[u8], on_release: Option<ReleaseCallback>) -> bool {
        let mut inner = self.inner.lock();
        match inner.get_mut(key) {
            Some(entry) => {
                if let Some(cb) = on_release {
                    entry.waiters.push(cb);
                }
                false
            }
            None => {
                let _ = inner.insert(key.to_vec(), LockEntry::default());
                trace!(key = ?key, "lock acquired");
                true
            }
        }
    }

    /// Releases `key`, firing registered waiter callbacks (outside the
    /// table lock) and waking blocked `with_lock` callers. Returns false
    /// when the key was not held.
    pub fn unlock(&self, key: &[u8]) -> bool {
        let entry = self.inner.lock().remove(key);
        match entry {
            Some(entry) => {
                self.released.notify_all();
                for waiter in entry.waiters {
                    waiter();
                }
                true
            }
            None => false,
        }
    }

    /// Whether `key` is currently held.
    pub fn has_lock(&self, key: &[u8]) -> bool {
        self.inner.lock().contains_key(key)
    }

    /// Runs `body` holding `key`, waiting for the current holder if
    /// needed. `closed` aborts the wait with `CLOSED_DURING_OPERATION`.
    pub fn with_lock<T>(
        &self,
        key: &[u8],
        closed: &AtomicBool,
        body: impl FnOnce() -> T,
    ) -> Result<T> {
        {
            let mut inner = self.inner.lock();
            loop {
                if closed.load(Ordering::Acquire) {
                    return Err(Error::closed_during_operation());
                }
                if !inner.contains_key(key) {
                    let _ = inner.insert(key.to_vec(), LockEntry::default());
                    break;
                }
                // Bounded wait so a close is noticed even without a wakeup.
                let _ = self
                    .released
                    .wait_for(&mut inner, Duration::from_millis(100));
            }
        }
        defer! {
            let _ = self.unlock(key);
        }
        Ok(body())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn exclusive_until_released() {
        let table = LockTable::default();
        assert!(table.try_lock(b"k", None));
        assert!(!table.try_lock(b"k", None));
        assert!(table.has_lock(b"k"));
        assert!(table.unlock(b"k"));
        assert!(!table.has_lock(b"k"));
        assert!(table.try_lock(b"k", None));
    }

    #[test]
    fn release_callbacks_fire_once() {
        let table = LockTable::default();
        let fired = Arc::new(AtomicUsize::new(0));
        assert!(table.try_lock(b"k", None));
        for _ in 0..3 {
            let fired = Arc::clone(&fired);
            assert!(!table.try_lock(
                b"k",
                Some(Box::new(move || {
                    let _ = fired.fetch_add(1, Ordering::SeqCst);
                }))
            ));
        }
        assert!(table.unlock(b"k"));
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert!(!table.unlock(b"k"));
    }

    #[test]
    fn with_lock_waits_for_the_holder() {
        let table = Arc::new(LockTable::default());
        let closed = Arc::new(AtomicBool::new(false));
        assert!(table.try_lock(b"k", None));

        let waiter = {
            let table = Arc::clone(&table);
            let closed = Arc::clone(&closed);
            std::thread::spawn(move || table.with_lock(b"k", &closed, || 42).unwrap())
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(table.unlock(b"k"));
        assert_eq!(waiter.join().unwrap(), 42);
        // The waiter released on exit.
        assert!(!table.has_lock(b"k"));
    }

    #[test]
    fn with_lock_fails_when_closed_mid_wait() {
        let table = Arc::new(LockTable::default());
        let closed = Arc::new(AtomicBool::new(false));
        assert!(table.try_lock(b"k", None));

        let waiter = {
            let table = Arc::clone(&table);
            let closed = Arc::clone(&closed);
            std::thread::spawn(move || table.with_lock(b"k", &closed, || ()))
        };
        std::thread::sleep(Duration::from_millis(50));
        closed.store(true, Ordering::Release);
        let err = waiter.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ClosedDuringOperation);
    }

    #[test]
    fn with_lock_releases_on_panic() {
        let table = Arc::new(LockTable::default());
        let closed = AtomicBool::new(false);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = table.with_lock(b"k", &closed, || panic!("boom"));
        }));
        assert!(result.is_err());
        assert!(!table.has_lock(b"k"));
    }
}
