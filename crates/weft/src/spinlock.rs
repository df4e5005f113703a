use std::cell::UnsafeCell;
use std::hint;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};

/// A test-and-set spinlock for short critical sections.
///
/// The fast path is a single weak compare-exchange; contended acquires spin
/// on a monotonic read with a CPU relax hint before retrying the exchange, so
/// the cache line is only written when the lock is observed free.
///
/// Spinlocks guard the stack pool free lists and nothing on the submit/yield
/// hot path. They must never be held across a fiber yield: the fiber may
/// resume on a different worker while another fiber on the original worker
/// spins forever.
pub struct SpinLock<T> {
    state: AtomicU32,
    value: UnsafeCell<T>,
}

// Safety: the lock provides the required exclusion; the value moves between
// threads only through the guard.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

impl<T> SpinLock<T> {
    /// Creates an unlocked spinlock around `value`.
    pub const fn new(value: T) -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, spinning until it is available.
    pub fn acquire(&self) -> SpinGuard<'_, T> {
        if self.try_exchange() {
            return SpinGuard { lock: self };
        }
        loop {
            while self.state.load(Ordering::Relaxed) != UNLOCKED {
                hint::spin_loop();
            }
            if self.try_exchange() {
                return SpinGuard { lock: self };
            }
        }
    }

    /// Tries to acquire the lock once, may fail.
    pub fn try_acquire(&self) -> Option<SpinGuard<'_, T>> {
        if self.try_exchange() {
            Some(SpinGuard { lock: self })
        } else {
            None
        }
    }

    #[inline]
    fn try_exchange(&self) -> bool {
        self.state
            .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn release(&self) {
        #[cfg(debug_assertions)]
        {
            let previous = self.state.swap(UNLOCKED, Ordering::Release);
            debug_assert!(previous == LOCKED, "spinlock unlock without a locked state");
        }
        #[cfg(not(debug_assertions))]
        self.state.store(UNLOCKED, Ordering::Release);
    }
}

/// Scoped guard returned by [`SpinLock::acquire`].
///
/// Releasing is tied to a concrete object, so acquire/release pairs cannot be
/// mismatched and an early `return` inside the critical section still
/// unlocks.
pub struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock, granting exclusive access.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock, granting exclusive access.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_exclusion() {
        let lock = Arc::new(SpinLock::new(0u64));
        let mut handles = vec![];

        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    *lock.acquire() += 1;
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*lock.acquire(), 40_000);
    }

    #[test]
    fn test_try_acquire_fails_while_held() {
        let lock = SpinLock::new(());
        let guard = lock.acquire();
        assert!(lock.try_acquire().is_none());
        drop(guard);
        assert!(lock.try_acquire().is_some());
    }
}
