//! Fiber descriptors.
//!
//! A fiber owns a stack, a saved machine context, the work descriptor it is
//! currently running, a drifter arena for transient allocations, and the link
//! field used while parked on a completion chain. Fibers live in a fixed pool
//! created at bootstrap; free slots circulate through an MPMC ring of
//! indices.
//!
//! A fiber is in exactly one of four states: queued in a ready ring, running
//! on some worker, linked into a chain's waiter list, or queued in the free
//! ring. Each state grants exclusive access to the descriptor to exactly one
//! party, which is what makes the `UnsafeCell` fields below sound: the ring
//! and waiter-list handoffs are all release/acquire pairs.

pub(crate) mod arch;
pub(crate) mod stack;

use crate::drift::Drift;
use crate::work::{Schedule, Work};
use arch::Context;
use stack::FiberStack;
use std::cell::{Cell, UnsafeCell};

/// Sentinel fiber index: "no fiber".
pub(crate) const FIBER_NONE: u32 = u32::MAX;

fn unassigned(_: *mut ()) {}

pub(crate) struct Fiber {
    /// Saved machine state; written by the context switch that suspends this
    /// fiber, consumed by the switch that resumes it.
    pub ctx: UnsafeCell<Context>,
    /// Current stack; replaced when an assignment needs a bigger one.
    pub stack: UnsafeCell<Option<FiberStack>>,
    /// The work descriptor currently assigned.
    pub work: UnsafeCell<Work>,
    /// Packed handle of the chain to release when the work returns.
    pub chain: Cell<u64>,
    /// Next waiter while parked on a chain.
    pub wait_next: Cell<u32>,
    /// Per-fiber transient allocator.
    pub drift: Drift,
    /// Handle of the last chain this fiber yielded on, for re-yield
    /// detection.
    #[cfg(debug_assertions)]
    pub last_yield: Cell<u64>,
}

// Safety: see the module header: state-machine handoffs give each field a
// single accessor at any instant, ordered by the ring/waiter-list
// release/acquire edges.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    pub(crate) fn new() -> Self {
        Self {
            ctx: UnsafeCell::new(Context::idle()),
            stack: UnsafeCell::new(None),
            work: UnsafeCell::new(Work::new(unassigned, std::ptr::null_mut())),
            chain: Cell::new(0),
            wait_next: Cell::new(FIBER_NONE),
            drift: Drift::new(),
            #[cfg(debug_assertions)]
            last_yield: Cell::new(u64::MAX),
        }
    }

    /// Scheduling class of the assigned work. Only meaningful while the
    /// fiber is assigned.
    pub(crate) fn schedule(&self) -> Schedule {
        // SAFETY: read-only access under the state-machine discipline; the
        // descriptor is immutable once submitted.
        unsafe { (*self.work.get()).schedule }
    }
}
