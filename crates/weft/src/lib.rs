//! weft: a fiber-based job system.
//!
//! Work is described by plain descriptors (a function pointer plus an opaque
//! data pointer) and executed by a fixed pool of fibers scheduled
//! cooperatively across worker threads. Yielding never blocks a thread: the
//! worker context-switches to another ready fiber, and the yielding fiber
//! resumes (possibly on a different worker) once the completion chain of
//! the work it waits on reaches zero.
//!
//! The design follows the fiber job system presented by Naughty Dog in the
//! GDC 2015 talk "Parallelizing the Naughty Dog Engine Using Fibers": a
//! bounded lock-free MPMC ring carries ready fibers between workers, worker 0
//! alone executes main-affinity work, and each fiber carries a bump arena
//! (the *drifter*) for transient allocations that die at well-known
//! reclamation points.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use weft::{framework_main, submit, yield_on, Framework, Work};
//!
//! static DONE: AtomicUsize = AtomicUsize::new(0);
//!
//! fn item(_: *mut ()) {
//!     DONE.fetch_add(1, Ordering::Relaxed);
//! }
//!
//! fn app_main(_: *mut (), _framework: &Framework) -> i32 {
//!     let work = [Work::new(item, std::ptr::null_mut()); 100];
//!     // SAFETY: the work touches only a static atomic.
//!     let chain = unsafe { submit(&work) };
//!     yield_on(Some(chain));
//!     assert_eq!(DONE.load(Ordering::Relaxed), 100);
//!     0
//! }
//!
//! let mut framework = Framework::default();
//! let code = framework_main(app_main, std::ptr::null_mut(), &mut framework);
//! assert_eq!(code, 0);
//! ```
//!
//! # Lifetime
//!
//! The scheduler state is process-wide and bracketed by
//! [`framework_main`]: every other API in this crate may only be called
//! between its bootstrap and its return, from the workers it owns.

mod chain;
mod defer;
mod drift;
mod fiber;
mod framework;
pub mod host;
mod invariants;
mod mpmc;
pub mod sanitize;
mod scheduler;
mod spinlock;
mod work;

pub use chain::Chain;
pub use defer::Defer;
pub use drift::Drift;
pub use framework::{
    framework_main, try_framework_main, Framework, FrameworkError, FrameworkHints, FrameworkHost,
    MainFn,
};
pub use mpmc::Mpmc;
pub use sanitize::{set_assert_sink, AssertFailure, AssertSink, AssertStatus};
pub use scheduler::{
    drift_alloc, drift_shift, drift_unshift, main_affinity, submit, submit_and_yield, with_drift,
    worker_index, yield_on,
};
pub use spinlock::{SpinGuard, SpinLock};
pub use work::{Schedule, Work, WorkFn};
