use crate::chain::{Chain, ChainCell, WAITER_NONE};
use crate::drift::Drift;
use crate::fiber::arch::{context_switch, Context};
use crate::fiber::stack::StackPool;
use crate::fiber::{Fiber, FIBER_NONE};
use crate::invariants::debug_assert_on_fiber;
use crate::mpmc::Mpmc;
use crate::weft_assert;
use crate::work::{Schedule, Work};
use crossbeam_utils::Backoff;
use std::cell::{Cell, UnsafeCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicUsize, Ordering};

// =============================================================================
// SCHEDULER
// =============================================================================
//
// Parallel worker threads over cooperatively scheduled fibers. Each worker
// owns a scheduling context (the stack its OS thread started on) and loops:
// dequeue a ready fiber, switch into it, and act on the verdict the fiber
// left behind when control came back: finished, parked on a chain, or
// rescheduled.
//
// ## The park race
//
// A fiber that yields on a chain is *installed into the waiter list from the
// scheduling context, after the switch away from it*. Installing before the
// switch would let another worker fire the chain, re-enqueue the fiber and
// resume it while it still runs on this worker. Between the fiber's switch
// to the scheduler and the park CAS the fiber is reachable from nowhere, so
// no one can resume it early.
//
// ## Migration
//
// Ready fibers go through global MPMC rings, so a fiber may resume on a
// different worker than it suspended on. Nothing thread-local survives a
// yield; `worker_index()` is re-read from TLS on every call, which is what
// keeps it correct (and only slice-valid) for user code.
//
// ## Affinity classes
//
// Worker 0 drains its private ring first, then the aggressive ring, then the
// global ring; other workers skip the private ring. Main-affinity work and
// main-affinity waiters are only ever enqueued to the private ring, giving
// the property that worker 0 executes every one of them.
//
// =============================================================================

pub(crate) struct Engine {
    default_stack_size: usize,
    pub(crate) thread_count: u32,
    pub(crate) fiber_count: u32,
    fibers: Box<[Fiber]>,
    chains: Box<[ChainCell]>,
    /// Default-class ready ring.
    ready: Mpmc<u32>,
    /// Aggressive-class ready ring, drained before `ready`.
    ready_hi: Mpmc<u32>,
    /// Worker-0 private ring for main-affinity work.
    local0: Mpmc<u32>,
    free_fibers: Mpmc<u32>,
    free_chains: Mpmc<u32>,
    stacks: StackPool,
    /// Fibers currently assigned to work (queued, running or parked).
    live: AtomicUsize,
    pub(crate) shutdown: AtomicBool,
    pub(crate) exit_code: AtomicI32,
}

impl Engine {
    pub(crate) fn new(
        default_stack_size: usize,
        thread_count: u32,
        fiber_count: u32,
        log2_work_count: u32,
    ) -> Box<Self> {
        let ring_capacity = 1usize << log2_work_count;
        let fiber_ring = (fiber_count as usize).next_power_of_two().max(2);
        let chain_count = (fiber_count as usize * 2).next_power_of_two().max(2);

        let engine = Box::new(Self {
            default_stack_size,
            thread_count,
            fiber_count,
            fibers: (0..fiber_count).map(|_| Fiber::new()).collect(),
            chains: (0..chain_count).map(|_| ChainCell::new()).collect(),
            ready: Mpmc::with_capacity(ring_capacity),
            ready_hi: Mpmc::with_capacity(ring_capacity),
            local0: Mpmc::with_capacity(ring_capacity),
            free_fibers: Mpmc::with_capacity(fiber_ring),
            free_chains: Mpmc::with_capacity(chain_count),
            stacks: StackPool::new(),
            live: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            exit_code: AtomicI32::new(-1),
        });

        for index in 0..fiber_count {
            let pushed = engine.free_fibers.enqueue(index);
            weft_assert!(pushed.is_ok(), "free-fiber ring undersized at bootstrap");
        }
        for index in 0..chain_count as u32 {
            let pushed = engine.free_chains.enqueue(index);
            weft_assert!(pushed.is_ok(), "free-chain ring undersized at bootstrap");
        }
        engine
    }

    /// Free-fiber count; equals `fiber_count` when the system is quiescent.
    pub(crate) fn free_fiber_count(&self) -> usize {
        self.free_fibers.len()
    }
}

static ENGINE: AtomicPtr<Engine> = AtomicPtr::new(ptr::null_mut());

/// Publishes the engine singleton. `framework_main` brackets the lifetime:
/// install, run, teardown.
pub(crate) fn install(engine: Box<Engine>) {
    let previous = ENGINE.swap(Box::into_raw(engine), Ordering::Release);
    weft_assert!(previous.is_null(), "framework_main is not reentrant");
}

/// Unpublishes and reclaims the engine. All workers must have joined.
pub(crate) fn teardown() -> Box<Engine> {
    let raw = ENGINE.swap(ptr::null_mut(), Ordering::AcqRel);
    weft_assert!(!raw.is_null(), "teardown without a running engine");
    // SAFETY: `install` created this pointer from a Box; workers are gone.
    unsafe { Box::from_raw(raw) }
}

/// True while an engine is installed.
pub(crate) fn is_installed() -> bool {
    !ENGINE.load(Ordering::Acquire).is_null()
}

pub(crate) fn engine() -> &'static Engine {
    let raw = ENGINE.load(Ordering::Acquire);
    assert!(
        !raw.is_null(),
        "the job system is not running; framework_main brackets its lifetime"
    );
    // SAFETY: non-null means installed and not yet torn down.
    unsafe { &*raw }
}

// -----------------------------------------------------------------------------
// Worker state
// -----------------------------------------------------------------------------

/// Verdict a fiber leaves for its worker when control returns to the
/// scheduling context.
#[derive(Clone, Copy)]
enum Action {
    /// No verdict; seeing this after a switch is a scheduler bug.
    Idle,
    /// The work function returned; free the fiber, release its chain.
    Finished,
    /// Park the fiber on this chain (from the scheduling context).
    Park(Chain),
    /// Put the fiber straight back on its ready ring.
    Reschedule,
}

struct WorkerSlot {
    index: i32,
    sched_ctx: UnsafeCell<Context>,
    current: Cell<u32>,
    action: Cell<Action>,
}

thread_local! {
    static WORKER: Cell<*mut WorkerSlot> = const { Cell::new(ptr::null_mut()) };
}

#[inline]
fn current_worker() -> *mut WorkerSlot {
    WORKER.with(Cell::get)
}

/// Runs a worker until shutdown. `index` 0 is the `framework_main` thread.
pub(crate) fn worker_loop(engine: &Engine, index: i32) {
    let mut slot = WorkerSlot {
        index,
        sched_ctx: UnsafeCell::new(Context::idle()),
        current: Cell::new(FIBER_NONE),
        action: Cell::new(Action::Idle),
    };
    // Every access to the slot (here, from fibers via TLS, from yield_on)
    // goes through this one pointer; the fields are cells, so shared derefs
    // are all that ever happens.
    let slot_ptr: *mut WorkerSlot = std::ptr::addr_of_mut!(slot);
    WORKER.with(|worker| worker.set(slot_ptr));
    log::debug!("worker {index} online");

    let backoff = Backoff::new();
    loop {
        if let Some(fiber_idx) = next_ready(engine, index) {
            backoff.reset();
            // SAFETY: the slot lives until this function returns.
            run_fiber(engine, unsafe { &*slot_ptr }, fiber_idx);
        } else {
            if engine.shutdown.load(Ordering::Acquire) && engine.live.load(Ordering::Acquire) == 0
            {
                break;
            }
            backoff.snooze();
        }
    }

    WORKER.with(|worker| worker.set(ptr::null_mut()));
    log::debug!("worker {index} offline");
}

fn next_ready(engine: &Engine, index: i32) -> Option<u32> {
    if index == 0 {
        if let Some(fiber) = engine.local0.dequeue() {
            return Some(fiber);
        }
    }
    engine.ready_hi.dequeue().or_else(|| engine.ready.dequeue())
}

fn run_fiber(engine: &Engine, slot: &WorkerSlot, fiber_idx: u32) {
    let fiber = &engine.fibers[fiber_idx as usize];
    slot.current.set(fiber_idx);
    slot.action.set(Action::Idle);

    // SAFETY: the fiber came off a ready ring, so its context and stack are
    // exclusively ours; the dequeue acquired every write of the publisher.
    unsafe { context_switch(slot.sched_ctx.get(), fiber.ctx.get()) };

    slot.current.set(FIBER_NONE);
    match slot.action.replace(Action::Idle) {
        Action::Finished => {
            let chain = Chain(fiber.chain.get());
            // Free the fiber before firing the chain: a woken waiter may
            // immediately need a fiber for a nested submit.
            let pushed = engine.free_fibers.enqueue(fiber_idx);
            weft_assert!(pushed.is_ok(), "free-fiber ring rejected a finished fiber");
            chain_release(engine, chain);
            engine.live.fetch_sub(1, Ordering::Release);
        }
        Action::Park(chain) => chain_park(engine, chain, fiber_idx),
        Action::Reschedule => enqueue_class(engine, fiber_idx, fiber.schedule()),
        Action::Idle => weft_assert!(false, "fiber returned control without a verdict"),
    }
}

/// Enqueues a ready fiber into the ring of its scheduling class, waiting for
/// space with backoff. Ring pressure is observable, never an error.
fn enqueue_class(engine: &Engine, fiber_idx: u32, class: Schedule) {
    let ring = match class {
        Schedule::MainAffinity => &engine.local0,
        Schedule::Aggressive => &engine.ready_hi,
        Schedule::Default => &engine.ready,
    };
    let backoff = Backoff::new();
    let mut value = fiber_idx;
    loop {
        match ring.enqueue(value) {
            Ok(()) => return,
            Err(back) => {
                value = back;
                backoff.snooze();
            }
        }
    }
}

fn chain_park(engine: &Engine, chain: Chain, fiber_idx: u32) {
    let fiber = &engine.fibers[fiber_idx as usize];
    let cell = &engine.chains[chain.slot() as usize];
    let parked = cell.append_waiter(chain.generation(), fiber_idx, |next| {
        fiber.wait_next.set(next);
    });
    if !parked {
        // The chain fired between the fiber's fast-path check and our CAS;
        // the fiber is ready again right away.
        enqueue_class(engine, fiber_idx, fiber.schedule());
    }
}

fn chain_release(engine: &Engine, chain: Chain) {
    if chain == Chain::COMPLETED {
        return;
    }
    let cell = &engine.chains[chain.slot() as usize];
    if cell.complete_one() {
        let generation = chain.generation();
        let mut waiter = cell.take_waiters(generation);
        while waiter != WAITER_NONE {
            let fiber = &engine.fibers[waiter as usize];
            // Read the link before enqueueing: once the waiter is published
            // it may run and reuse the field.
            let next = fiber.wait_next.get();
            enqueue_class(engine, waiter, fiber.schedule());
            waiter = next;
        }
        cell.recycle(generation);
        let pushed = engine.free_chains.enqueue(chain.slot());
        weft_assert!(pushed.is_ok(), "free-chain ring rejected a recycled cell");
    }
}

// -----------------------------------------------------------------------------
// Fiber entry
// -----------------------------------------------------------------------------

pub(crate) extern "C" fn fiber_entry(arg: *mut ()) -> ! {
    // SAFETY: `arg` is the fiber pointer installed by `prepare_fiber`.
    let fiber = unsafe { &*arg.cast::<Fiber>() };
    // SAFETY: the descriptor is immutable while the fiber is assigned.
    let work = unsafe { *fiber.work.get() };

    if let Err(_panic) = catch_unwind(AssertUnwindSafe(|| (work.func)(work.data))) {
        log::error!(
            "work item '{}' panicked; treated as completed",
            work.name.unwrap_or("<unnamed>")
        );
    }

    fiber.drift.rewind_all();

    // Re-read the worker: the fiber may have migrated while running.
    let worker = current_worker();
    weft_assert!(!worker.is_null(), "fiber finished outside the worker pool");
    // SAFETY: the slot belongs to this thread for the whole execution slice.
    let slot = unsafe { &*worker };
    slot.action.set(Action::Finished);
    // SAFETY: saving into our own context (never resumed; the next
    // assignment rebuilds it) and resuming the worker's scheduling context.
    unsafe { context_switch(fiber.ctx.get(), slot.sched_ctx.get()) };
    unreachable!("terminated fibers are never resumed");
}

/// # Safety
///
/// The fiber was popped from the free ring, granting exclusive access.
unsafe fn prepare_fiber(engine: &Engine, fiber: &Fiber, work: Work, chain: Chain) {
    unsafe {
        *fiber.work.get() = work;
        fiber.chain.set(chain.0);
        fiber.wait_next.set(WAITER_NONE);
        // u64::MAX is Chain::COMPLETED, which never reaches the re-yield
        // check, so it is a safe "no yield yet" sentinel.
        #[cfg(debug_assertions)]
        fiber.last_yield.set(u64::MAX);

        let needed = work.stack_size.max(engine.default_stack_size);
        let stack_slot = &mut *fiber.stack.get();
        if stack_slot.as_ref().map_or(true, |stack| stack.usable() < needed) {
            if let Some(old) = stack_slot.take() {
                engine.stacks.release(old);
            }
            *stack_slot = Some(engine.stacks.acquire(needed));
        }
        let top = stack_slot.as_ref().expect("stack installed above").top();
        *fiber.ctx.get() =
            Context::fresh(top, fiber_entry, ptr::from_ref(fiber).cast_mut().cast());
    }
}

// -----------------------------------------------------------------------------
// Public API
// -----------------------------------------------------------------------------

/// Submits `work` to the job system and returns immediately.
///
/// The returned [`Chain`] completes when every item has finished; pass it to
/// [`yield_on`] to wait. An empty slice returns a pre-completed chain.
/// Resource exhaustion (no free fiber, full ready ring) waits with CPU
/// relax; it is not an error.
///
/// # Safety
///
/// Every descriptor's `data` pointer must stay valid until the chain
/// completes, and the pointee must tolerate access from whichever worker
/// thread runs the item.
pub unsafe fn submit(work: &[Work]) -> Chain {
    let engine = engine();
    if work.is_empty() {
        return Chain::COMPLETED;
    }

    let backoff = Backoff::new();
    let slot = loop {
        if let Some(slot) = engine.free_chains.dequeue() {
            break slot;
        }
        backoff.snooze();
    };
    let cell = &engine.chains[slot as usize];
    let generation = cell.begin(work.len() as isize);
    let chain = Chain::new(slot, generation);

    for descriptor in work {
        backoff.reset();
        let fiber_idx = loop {
            if let Some(fiber) = engine.free_fibers.dequeue() {
                break fiber;
            }
            backoff.snooze();
        };
        let fiber = &engine.fibers[fiber_idx as usize];
        // SAFETY: popped from the free ring, exclusively ours until the
        // enqueue below publishes it.
        unsafe { prepare_fiber(engine, fiber, *descriptor, chain) };
        engine.live.fetch_add(1, Ordering::Relaxed);
        enqueue_class(engine, fiber_idx, descriptor.schedule);
    }
    chain
}

/// Submits `work` and yields until it completes.
///
/// # Safety
///
/// Same contract as [`submit`]; additionally must be called from a fiber.
pub unsafe fn submit_and_yield(work: &[Work]) {
    let chain = unsafe { submit(work) };
    yield_on(Some(chain));
}

/// Yields the current fiber.
///
/// With `Some(chain)`, the fiber parks until the chain completes; the chain
/// is invalidated once this returns and yielding on it again is a
/// programming error (debug-asserted). With `None` this is a cooperative
/// reschedule hint: the fiber requeues itself only when other ready work is
/// observable, otherwise it keeps running.
///
/// After this returns, the fiber may be running on a **different** worker
/// thread; nothing derived from `worker_index()` before the call is still
/// meaningful.
pub fn yield_on(chain: Option<Chain>) {
    let worker = current_worker();
    weft_assert!(!worker.is_null(), "yield_on called off the worker pool");
    if worker.is_null() {
        return;
    }
    // SAFETY: the slot belongs to this thread.
    let slot = unsafe { &*worker };
    let current = slot.current.get();
    debug_assert_on_fiber!(current);
    if current == FIBER_NONE {
        return;
    }
    let engine = engine();
    let fiber = &engine.fibers[current as usize];

    match chain {
        None => {
            let busy = !engine.ready_hi.is_empty()
                || !engine.ready.is_empty()
                || (slot.index == 0 && !engine.local0.is_empty());
            if !busy {
                return;
            }
            slot.action.set(Action::Reschedule);
            // SAFETY: suspending into our own context, resuming the worker's
            // scheduling context. `slot` is not touched after the switch;
            // the fiber may wake on another worker.
            unsafe { context_switch(fiber.ctx.get(), slot.sched_ctx.get()) };
        }
        Some(chain) if chain == Chain::COMPLETED => {}
        Some(chain) => {
            #[cfg(debug_assertions)]
            debug_assert!(
                fiber.last_yield.get() != chain.0,
                "yield on an invalidated chain"
            );
            let cell = &engine.chains[chain.slot() as usize];
            if !cell.is_fired(chain.generation()) {
                slot.action.set(Action::Park(chain));
                // SAFETY: as above; the worker installs us into the waiter
                // list after this switch completes.
                unsafe { context_switch(fiber.ctx.get(), slot.sched_ctx.get()) };
            }
            #[cfg(debug_assertions)]
            fiber.last_yield.set(chain.0);
        }
    }
}

/// Index of the worker thread the caller's fiber is running on, in
/// `[0, thread_count)`; −1 outside the worker pool.
///
/// Only valid until the next yield: fibers migrate between workers when work
/// is resumed.
#[inline]
pub fn worker_index() -> i32 {
    let worker = current_worker();
    if worker.is_null() {
        return -1;
    }
    // SAFETY: the slot belongs to this thread.
    unsafe { (*worker).index }
}

/// True when called from worker 0, the only worker allowed to execute
/// [`Schedule::MainAffinity`] work.
#[inline]
pub fn main_affinity() -> bool {
    worker_index() == 0
}

// -----------------------------------------------------------------------------
// Drifter access
// -----------------------------------------------------------------------------

fn current_fiber() -> &'static Fiber {
    let worker = current_worker();
    assert!(!worker.is_null(), "drifter access requires a running fiber");
    // SAFETY: the slot belongs to this thread.
    let current = unsafe { (*worker).current.get() };
    assert!(current != FIBER_NONE, "drifter access requires a running fiber");
    &engine().fibers[current as usize]
}

/// Scoped access to the current fiber's drifter, e.g. for building command
/// streams. The reference must not be stashed past the closure: the drifter
/// dies with the fiber.
pub fn with_drift<R>(f: impl FnOnce(&Drift) -> R) -> R {
    f(&current_fiber().drift)
}

/// Allocates from the current fiber's drifter. The memory is valid until the
/// matching [`drift_unshift`] or fiber termination.
pub fn drift_alloc(size: usize, align: usize) -> *mut u8 {
    current_fiber().drift.alloc(size, align).as_ptr()
}

/// Pushes a reclamation boundary on the current fiber's drifter.
pub fn drift_shift() {
    current_fiber().drift.shift();
}

/// Pops the most recent boundary, logically freeing everything allocated
/// above it.
pub fn drift_unshift() {
    current_fiber().drift.unshift();
}
