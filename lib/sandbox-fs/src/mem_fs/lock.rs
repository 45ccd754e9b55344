//! Lock strategies for the in-memory filesystem.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::lock_api::{GuardNoSend, RawRwLock};

/// The raw lock guarding the index and every file's content.
///
/// [`parking_lot::RawRwLock`] is the default; [`SingleThreaded`] trades
/// blocking for a panic on contention.
pub trait LockStrategy: RawRwLock + Send + Sync + 'static {}

impl<T> LockStrategy for T where T: RawRwLock + Send + Sync + 'static {}

const WRITER: usize = 1 << (usize::BITS - 1);

/// A lock for callers that never use a filesystem from two threads at once.
///
/// Acquiring it never blocks. A conflicting acquisition, which can only
/// happen when that promise is broken, panics instead of waiting.
pub struct SingleThreaded {
    state: AtomicUsize,
}

// SAFETY: `state` is either `WRITER` alone or a count of readers, and every
// transition out of 0 or into a higher reader count is a compare-exchange, so
// an exclusive lock is only granted with no readers and no other writer, and
// a shared lock never while a writer holds it. Acquire on lock pairs with
// Release on unlock. A failed acquisition panics instead of returning without
// the lock.
unsafe impl RawRwLock for SingleThreaded {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = SingleThreaded {
        state: AtomicUsize::new(0),
    };

    type GuardMarker = GuardNoSend;

    fn lock_shared(&self) {
        if !self.try_lock_shared() {
            panic!("single-threaded filesystem read while it is being modified");
        }
    }

    fn try_lock_shared(&self) -> bool {
        let mut current = self.state.load(Ordering::Relaxed);
        loop {
            if current & WRITER != 0 {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    unsafe fn unlock_shared(&self) {
        self.state.fetch_sub(1, Ordering::Release);
    }

    fn lock_exclusive(&self) {
        if !self.try_lock_exclusive() {
            panic!("single-threaded filesystem modified while it is in use");
        }
    }

    fn try_lock_exclusive(&self) -> bool {
        self.state
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock_exclusive(&self) {
        self.state.store(0, Ordering::Release);
    }
}
