use crate::fiber::FIBER_NONE;
use crate::invariants::debug_assert_pending_positive;
use std::sync::atomic::{fence, AtomicIsize, AtomicU64, Ordering};

// =============================================================================
// COMPLETION CHAINS
// =============================================================================
//
// A chain is the atomic counter bound to one submission. Cells live in a
// fixed pool; a handle packs {slot index, generation} into one u64 (index in
// the low word, the same bit layout the render handles use), and the
// generation lets a stale handle observe "already fired" instead of touching
// a recycled cell.
//
// ## Waiter list
//
// The waiter head packs {generation:u32, fiber:u32} into a single AtomicU64.
// Because the generation is part of the compared value, an append CAS racing
// with fire-and-recycle can never land a waiter on the cell's *next* life:
//
//   append:  CAS {gen, old_fiber} -> {gen, my_fiber}       (Release)
//   fire:    swap head -> {gen, POISONED}                  (AcqRel)
//   recycle: store {gen+1, NONE}                           (Release)
//
// An appender that loses the race re-reads the head, sees either POISONED or
// a different generation, and re-enqueues its fiber into the ready ring
// immediately; both orders of the pending->0 / append race terminate with
// every waiter eventually ready.
//
// ## Ordering
//
// Completion of all work in a chain happens-before any waiter resumes: every
// decrement is Release, the decrement that reaches zero performs an Acquire
// fence before draining, and the drain publishes each waiter through the
// ready ring's own release/acquire pair.
//
// =============================================================================

/// Waiter-list sentinel: empty list.
pub(crate) const WAITER_NONE: u32 = FIBER_NONE;
/// Waiter-list sentinel: the chain has fired; park nothing, ever again.
pub(crate) const WAITER_POISONED: u32 = FIBER_NONE - 1;

#[inline]
fn pack(generation: u32, low: u32) -> u64 {
    (u64::from(generation) << 32) | u64::from(low)
}

#[inline]
fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

/// Handle to the completion chain of one submission.
///
/// Returned by [`submit`](crate::submit); consumed by
/// [`yield_on`](crate::yield_on). After a yield on it returns, the chain is
/// invalidated; a further yield returns immediately and is flagged as a
/// programming error in debug builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chain(pub(crate) u64);

impl Chain {
    /// The pre-completed chain returned for empty submissions. Yielding on
    /// it returns immediately.
    pub(crate) const COMPLETED: Chain = Chain(u64::MAX);

    #[inline]
    pub(crate) fn new(slot: u32, generation: u32) -> Self {
        Self(pack(generation, slot))
    }

    #[inline]
    pub(crate) fn slot(self) -> u32 {
        unpack(self.0).1
    }

    #[inline]
    pub(crate) fn generation(self) -> u32 {
        unpack(self.0).0
    }
}

/// One pooled chain cell.
pub(crate) struct ChainCell {
    /// Work items not yet finished.
    pending: AtomicIsize,
    /// Packed `{generation, waiter fiber}` head of the intrusive waiter
    /// list.
    head: AtomicU64,
}

impl ChainCell {
    pub(crate) fn new() -> Self {
        Self {
            pending: AtomicIsize::new(0),
            head: AtomicU64::new(pack(0, WAITER_NONE)),
        }
    }

    /// Arms the cell for a new submission of `count` items and returns the
    /// cell's current generation.
    ///
    /// The caller owns the cell exclusively (it was just popped from the
    /// free-chain ring), so plain ordering suffices: the work items are
    /// published through the ready rings.
    pub(crate) fn begin(&self, count: isize) -> u32 {
        let (generation, waiter) = unpack(self.head.load(Ordering::Relaxed));
        debug_assert!(waiter == WAITER_NONE, "recycled chain cell with live waiters");
        self.pending.store(count, Ordering::Relaxed);
        generation
    }

    /// True when the chain of `generation` has already fired (or the cell
    /// has moved on to a later generation).
    pub(crate) fn is_fired(&self, generation: u32) -> bool {
        let (current, waiter) = unpack(self.head.load(Ordering::Acquire));
        current != generation || waiter == WAITER_POISONED
    }

    /// Attempts to park `fiber` on the chain of `generation`.
    ///
    /// `link` is called with the previous head before each CAS attempt so the
    /// caller can thread its intrusive `wait_next` field. Returns `false`
    /// when the chain already fired; the caller must re-enqueue the fiber
    /// itself.
    pub(crate) fn append_waiter(
        &self,
        generation: u32,
        fiber: u32,
        link: impl Fn(u32),
    ) -> bool {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let (current, first) = unpack(head);
            if current != generation || first == WAITER_POISONED {
                return false;
            }
            link(first);
            // Weak exchange in a retry loop; Release publishes the link
            // write, Acquire on failure re-observes a fired head.
            match self.head.compare_exchange_weak(
                head,
                pack(generation, fiber),
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current_head) => head = current_head,
            }
        }
    }

    /// Records one finished work item. Returns `true` when this call drove
    /// the pending count to zero; the caller then owns the fire sequence.
    pub(crate) fn complete_one(&self) -> bool {
        let previous = self.pending.fetch_sub(1, Ordering::Release);
        debug_assert_pending_positive!(previous);
        if previous == 1 {
            // Pair with the Release decrements of every other finisher so
            // the drain below observes all of their work.
            fence(Ordering::Acquire);
            return true;
        }
        false
    }

    /// Poisons the waiter list and returns its first fiber (LIFO order).
    /// Only the finisher that observed `complete_one() == true` may call
    /// this.
    pub(crate) fn take_waiters(&self, generation: u32) -> u32 {
        let head = self
            .head
            .swap(pack(generation, WAITER_POISONED), Ordering::AcqRel);
        let (current, first) = unpack(head);
        debug_assert!(current == generation, "chain fired under a foreign generation");
        first
    }

    /// Advances the generation and clears the waiter list, making the cell
    /// safe to hand back to the free-chain ring.
    pub(crate) fn recycle(&self, generation: u32) {
        self.head
            .store(pack(generation.wrapping_add(1), WAITER_NONE), Ordering::Release);
    }
}
