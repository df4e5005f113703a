//! Debug assertion macros for the invariants of the job system's shared
//! structures.
//!
//! These macros are only active in debug builds (`#[cfg(debug_assertions)]`),
//! so there is zero overhead in release builds.
//!
//! Used by `Mpmc<T>`, the completion chain, the drifter and the scheduler.

// =============================================================================
// Cell sequence discipline
// =============================================================================

/// Assert that a cell sequence never falls more than one lap behind the
/// cursor that observes it.
///
/// **Invariant**: `seq - pos >= -capacity`. A stale cursor can legitimately
/// see a cell arbitrarily far *ahead* (the operation reloads and retries),
/// but a sequence below one lap behind means corrupted cell state.
///
/// Used in: `Mpmc::enqueue()` / `Mpmc::dequeue()`
macro_rules! debug_assert_cell_sequence {
    ($delta:expr, $capacity:expr) => {
        debug_assert!(
            $delta >= -($capacity as isize),
            "cell sequence fell {} positions behind its cursor (capacity {})",
            -$delta,
            $capacity
        )
    };
}

// =============================================================================
// Chain arithmetic
// =============================================================================

/// Assert that a chain's pending count never goes negative.
///
/// **Invariant**: the sum of decrements equals the submitted work count;
/// `pending >= 0` at every observable point
///
/// Used in: `chain::release()` after `fetch_sub`
macro_rules! debug_assert_pending_positive {
    ($previous:expr) => {
        debug_assert!(
            $previous >= 1,
            "chain pending count went negative (previous value {})",
            $previous
        )
    };
}

// =============================================================================
// Execution context
// =============================================================================

/// Assert that the caller is running inside a user fiber.
///
/// **Invariant**: `yield_on`, `drift_alloc`, `drift_shift` and
/// `drift_unshift` may only be called from work submitted to the job system
///
/// Used in: `scheduler::yield_on()`, the `drift_*` free functions
macro_rules! debug_assert_on_fiber {
    ($current:expr) => {
        debug_assert!(
            $current != crate::fiber::FIBER_NONE,
            "called from a scheduling context, not from a user fiber"
        )
    };
}

// =============================================================================
// Drifter boundary discipline
// =============================================================================

/// Assert that an `unshift` has a matching `shift`.
///
/// **Invariant**: boundaries form a LIFO; popping an empty boundary stack is
/// undefined in release and caught here in debug
///
/// Used in: `Drift::unshift()`
macro_rules! debug_assert_drift_balanced {
    ($boundary:expr) => {
        debug_assert!(
            !$boundary.is_null(),
            "drift_unshift without a matching drift_shift"
        )
    };
}

// =============================================================================
// Re-exports for crate-internal use
// =============================================================================

pub(crate) use debug_assert_cell_sequence;
pub(crate) use debug_assert_drift_balanced;
pub(crate) use debug_assert_on_fiber;
pub(crate) use debug_assert_pending_positive;
