//! Fiber stacks and the process-wide stack pool.
//!
//! Stacks are anonymous private mappings with a `PROT_NONE` guard page at the
//! low end, so an overflow faults instead of silently corrupting a
//! neighbouring fiber. The pool recycles stacks by usable size: a returned
//! stack satisfies any later request of equal or smaller size.
//!
//! Mapping failure is fatal (the job system cannot run work without stacks)
//! and is routed through the assertion sink.

use crate::spinlock::SpinLock;
use crate::weft_assert;
use std::ptr::{self, NonNull};

/// A guard-paged fiber stack.
pub(crate) struct FiberStack {
    /// Mapping base: the guard page.
    base: NonNull<u8>,
    /// Full mapping length including the guard page.
    total: usize,
    /// Usable bytes above the guard page.
    usable: usize,
}

// Safety: the mapping is exclusively owned; fibers carry their stack across
// workers and the context switch orders all accesses.
unsafe impl Send for FiberStack {}

impl FiberStack {
    /// Maps a stack with at least `usable_hint` usable bytes.
    pub(crate) fn new(usable_hint: usize) -> Self {
        let page = crate::host::page_size();
        let usable = usable_hint.max(page).div_ceil(page) * page;
        let total = usable + page;

        // SAFETY: fresh anonymous mapping; arguments are well-formed.
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        weft_assert!(
            raw != libc::MAP_FAILED,
            "fiber stack mapping of {total} bytes failed"
        );
        let base = NonNull::new(raw.cast::<u8>()).expect("mmap returned null");

        // SAFETY: the low page belongs to the fresh mapping above.
        let guarded = unsafe { libc::mprotect(base.as_ptr().cast(), page, libc::PROT_NONE) };
        weft_assert!(guarded == 0, "fiber stack guard page protection failed");

        Self { base, total, usable }
    }

    /// Usable bytes above the guard page.
    #[inline]
    pub(crate) fn usable(&self) -> usize {
        self.usable
    }

    /// Top of the stack (one past the highest usable byte).
    #[inline]
    pub(crate) fn top(&self) -> *mut u8 {
        // SAFETY: `total` is the mapping length.
        unsafe { self.base.as_ptr().add(self.total) }
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        // SAFETY: `base`/`total` describe a mapping we own.
        unsafe { libc::munmap(self.base.as_ptr().cast(), self.total) };
    }
}

/// Process-wide pool of recycled fiber stacks.
pub(crate) struct StackPool {
    free: SpinLock<Vec<FiberStack>>,
}

impl StackPool {
    pub(crate) fn new() -> Self {
        Self {
            free: SpinLock::new(Vec::new()),
        }
    }

    /// Returns a stack with at least `min_usable` usable bytes, recycling a
    /// pooled one when possible.
    pub(crate) fn acquire(&self, min_usable: usize) -> FiberStack {
        {
            let mut free = self.free.acquire();
            if let Some(at) = free.iter().position(|s| s.usable() >= min_usable) {
                return free.swap_remove(at);
            }
        }
        FiberStack::new(min_usable)
    }

    /// Returns a stack to the pool.
    pub(crate) fn release(&self, stack: FiberStack) {
        self.free.acquire().push(stack);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_is_writable_to_the_top() {
        let stack = FiberStack::new(16 * 1024);
        assert!(stack.usable() >= 16 * 1024);

        // Touch the extremes of the usable region.
        unsafe {
            let top = stack.top();
            top.sub(1).write(0xaa);
            top.sub(stack.usable()).write(0xbb);
            assert_eq!(top.sub(1).read(), 0xaa);
        }
    }

    #[test]
    fn test_pool_recycles_by_size() {
        let pool = StackPool::new();

        let first = pool.acquire(32 * 1024);
        let first_top = first.top() as usize;
        pool.release(first);

        // Same-or-smaller request gets the pooled mapping back.
        let again = pool.acquire(16 * 1024);
        assert_eq!(again.top() as usize, first_top);

        // A larger request maps fresh.
        let bigger = pool.acquire(1024 * 1024);
        assert!(bigger.usable() >= 1024 * 1024);
    }
}
