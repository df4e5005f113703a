//! End-to-end scheduler scenarios driven through the public API.
//!
//! The job system is a process-wide singleton bracketed by `framework_main`,
//! so every test here serializes on one mutex and brings the framework up
//! and down itself.

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Mutex;
use weft::{
    defer, framework_main, main_affinity, submit, submit_and_yield, worker_index, yield_on,
    Framework, FrameworkHints, Schedule, SpinLock, Work,
};

static FRAMEWORK_LOCK: Mutex<()> = Mutex::new(());

fn run_framework(hints: FrameworkHints, main_fn: weft::MainFn) -> i32 {
    let _guard = FRAMEWORK_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let _ = env_logger::builder().is_test(true).try_init();
    let mut framework = Framework {
        engine_name: "weft",
        app_name: "scheduler-tests",
        hints,
        ..Framework::default()
    };
    framework_main(main_fn, std::ptr::null_mut(), &mut framework)
}

// -----------------------------------------------------------------------------
// Basic completion: every submitted item runs exactly once
// -----------------------------------------------------------------------------

static BASIC_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn basic_item(_: *mut ()) {
    BASIC_COUNTER.fetch_add(1, Ordering::Relaxed);
}

fn basic_main(_: *mut (), _: &Framework) -> i32 {
    const COUNT: usize = 1000;
    let work = vec![Work::new(basic_item, std::ptr::null_mut()); COUNT];

    // SAFETY: the items touch only a static atomic.
    let chain = unsafe { submit(&work) };
    yield_on(Some(chain));

    assert_eq!(
        BASIC_COUNTER.load(Ordering::Relaxed),
        COUNT,
        "yield_on returned before every item finished"
    );
    0
}

#[test]
fn test_thousand_items_complete_before_yield_returns() {
    let code = run_framework(FrameworkHints::new(64 * 1024, 0, 64, 12), basic_main);
    // Exit code 0 also proves the fiber pool drained back to full: shutdown
    // asserts on leaked fibers.
    assert_eq!(code, 0);
}

// -----------------------------------------------------------------------------
// Nested submits: work that submits and waits on more work
// -----------------------------------------------------------------------------

static NESTED_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn nested_inner(_: *mut ()) {
    NESTED_COUNTER.fetch_add(1, Ordering::Relaxed);
}

fn nested_outer(_: *mut ()) {
    let inner = [Work::new(nested_inner, std::ptr::null_mut()); 10];
    // SAFETY: the items touch only a static atomic.
    unsafe { submit_and_yield(&inner) };
}

fn nested_main(_: *mut (), _: &Framework) -> i32 {
    let outer = [Work::new(nested_outer, std::ptr::null_mut()); 4];
    // SAFETY: as above.
    let chain = unsafe { submit(&outer) };
    yield_on(Some(chain));

    assert_eq!(NESTED_COUNTER.load(Ordering::Relaxed), 40);
    0
}

#[test]
fn test_nested_submits() {
    let code = run_framework(FrameworkHints::new(64 * 1024, 0, 64, 12), nested_main);
    assert_eq!(code, 0);
}

// -----------------------------------------------------------------------------
// Main affinity: worker 0 executes every main-affinity item
// -----------------------------------------------------------------------------

static AFFINITY_RUNS: AtomicUsize = AtomicUsize::new(0);
static AFFINITY_STRAYS: AtomicUsize = AtomicUsize::new(0);

fn affinity_item(_: *mut ()) {
    AFFINITY_RUNS.fetch_add(1, Ordering::Relaxed);
    if !main_affinity() {
        AFFINITY_STRAYS.fetch_add(1, Ordering::Relaxed);
    }
}

fn affinity_main(_: *mut (), _: &Framework) -> i32 {
    let work =
        [Work::new(affinity_item, std::ptr::null_mut()).schedule(Schedule::MainAffinity); 100];
    // SAFETY: the items touch only static atomics.
    let chain = unsafe { submit(&work) };
    yield_on(Some(chain));

    assert_eq!(AFFINITY_RUNS.load(Ordering::Relaxed), 100);
    assert_eq!(
        AFFINITY_STRAYS.load(Ordering::Relaxed),
        0,
        "a main-affinity item executed off worker 0"
    );
    0
}

#[test]
fn test_main_affinity_executes_on_worker_zero_only() {
    let code = run_framework(FrameworkHints::new(64 * 1024, 4, 64, 12), affinity_main);
    assert_eq!(code, 0);
}

// -----------------------------------------------------------------------------
// Migration: worker_index is valid before and after a yield, not equal
// -----------------------------------------------------------------------------

static MIGRATION_BAD_INDEX: AtomicUsize = AtomicUsize::new(0);

fn migration_filler(_: *mut ()) {
    std::hint::spin_loop();
}

fn migration_prober(data: *mut ()) {
    let thread_count = data as usize;

    let before = worker_index();
    if before < 0 || before >= thread_count as i32 {
        MIGRATION_BAD_INDEX.fetch_add(1, Ordering::Relaxed);
    }

    // Park on real sub-work so the fiber goes through the waiter list.
    let filler = [Work::new(migration_filler, std::ptr::null_mut()); 8];
    // SAFETY: filler items touch nothing.
    unsafe { submit_and_yield(&filler) };

    // Both observations must be valid; equality is not guaranteed either
    // way, so only validity is asserted.
    let after = worker_index();
    if after < 0 || after >= thread_count as i32 {
        MIGRATION_BAD_INDEX.fetch_add(1, Ordering::Relaxed);
    }
}

fn migration_main(_: *mut (), framework: &Framework) -> i32 {
    let thread_count = framework
        .host
        .cpu_thread_count
        .clamp(1, framework.hints.thread_count.max(1) as i32) as usize;

    let probes = [Work::new(migration_prober, thread_count as *mut ()); 32];
    // SAFETY: probes touch static atomics and submit inert filler work.
    let chain = unsafe { submit(&probes) };
    yield_on(Some(chain));

    assert_eq!(MIGRATION_BAD_INDEX.load(Ordering::Relaxed), 0);
    0
}

#[test]
fn test_worker_index_valid_across_yield() {
    let code = run_framework(FrameworkHints::new(64 * 1024, 4, 64, 12), migration_main);
    assert_eq!(code, 0);
}

// -----------------------------------------------------------------------------
// Maybe-yield and pre-completed chains
// -----------------------------------------------------------------------------

fn hint_main(_: *mut (), _: &Framework) -> i32 {
    // Empty submission: a pre-completed chain that yields straight through.
    // SAFETY: nothing is submitted.
    let chain = unsafe { submit(&[]) };
    yield_on(Some(chain));

    // Maybe-yield with nothing else ready: must return promptly.
    yield_on(None);
    yield_on(None);
    7
}

#[test]
fn test_maybe_yield_and_empty_submit() {
    let code = run_framework(FrameworkHints::new(64 * 1024, 2, 16, 8), hint_main);
    assert_eq!(code, 7);
}

// -----------------------------------------------------------------------------
// Scheduling classes: aggressive work completes like any other
// -----------------------------------------------------------------------------

static CLASS_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn class_item(_: *mut ()) {
    CLASS_COUNTER.fetch_add(1, Ordering::Relaxed);
}

fn class_main(_: *mut (), _: &Framework) -> i32 {
    let mut work = Vec::new();
    for index in 0..90 {
        let schedule = match index % 3 {
            0 => Schedule::Default,
            1 => Schedule::Aggressive,
            _ => Schedule::MainAffinity,
        };
        work.push(Work::new(class_item, std::ptr::null_mut()).schedule(schedule));
    }
    // SAFETY: the items touch only a static atomic.
    let chain = unsafe { submit(&work) };
    yield_on(Some(chain));

    assert_eq!(CLASS_COUNTER.load(Ordering::Relaxed), 90);
    0
}

#[test]
fn test_mixed_scheduling_classes_complete() {
    let code = run_framework(FrameworkHints::new(64 * 1024, 0, 64, 12), class_main);
    assert_eq!(code, 0);
}

// -----------------------------------------------------------------------------
// Defers across a yield: cleanup order survives fiber migration
// -----------------------------------------------------------------------------

static DEFER_TRACE: SpinLock<String> = SpinLock::new(String::new());

fn defer_filler(_: *mut ()) {}

fn defer_item(_: *mut ()) {
    defer!(DEFER_TRACE.acquire().push('A'));
    defer!(DEFER_TRACE.acquire().push('B'));

    // Suspend mid-scope; the defer records live on the fiber stack and
    // travel with it.
    let filler = [Work::new(defer_filler, std::ptr::null_mut()); 4];
    // SAFETY: filler items touch nothing.
    unsafe { submit_and_yield(&filler) };

    defer!(DEFER_TRACE.acquire().push('C'));
}

fn defer_main(_: *mut (), _: &Framework) -> i32 {
    let work = [Work::new(defer_item, std::ptr::null_mut())];
    // SAFETY: the item touches a spin-locked static string.
    let chain = unsafe { submit(&work) };
    yield_on(Some(chain));

    assert_eq!(*DEFER_TRACE.acquire(), "CBA");
    0
}

#[test]
fn test_defer_order_across_yield() {
    let code = run_framework(FrameworkHints::new(64 * 1024, 0, 32, 10), defer_main);
    assert_eq!(code, 0);
}

// -----------------------------------------------------------------------------
// Drifter free functions inside fibers
// -----------------------------------------------------------------------------

static DRIFT_FAILURES: AtomicUsize = AtomicUsize::new(0);

fn drift_item(_: *mut ()) {
    weft::drift_shift();
    let first = weft::drift_alloc(64, 16);
    let second = weft::drift_alloc(64, 16);
    if first.is_null() || second.is_null() || first == second {
        DRIFT_FAILURES.fetch_add(1, Ordering::Relaxed);
    }
    // SAFETY: both blocks were just allocated from this fiber's drifter.
    unsafe {
        first.write_bytes(0x11, 64);
        second.write_bytes(0x22, 64);
        if first.read() != 0x11 || second.read() != 0x22 {
            DRIFT_FAILURES.fetch_add(1, Ordering::Relaxed);
        }
    }
    weft::drift_unshift();

    // After unshift the cursor rewinds: the next allocation reuses the spot.
    weft::drift_shift();
    let again = weft::drift_alloc(64, 16);
    if again != first {
        DRIFT_FAILURES.fetch_add(1, Ordering::Relaxed);
    }
    weft::drift_unshift();
}

fn drift_main(_: *mut (), _: &Framework) -> i32 {
    let work = [Work::new(drift_item, std::ptr::null_mut()); 16];
    // SAFETY: the items touch only their own drifter and a static atomic.
    let chain = unsafe { submit(&work) };
    yield_on(Some(chain));

    assert_eq!(DRIFT_FAILURES.load(Ordering::Relaxed), 0);
    0
}

#[test]
fn test_drift_free_functions_inside_fibers() {
    let code = run_framework(FrameworkHints::new(64 * 1024, 0, 32, 10), drift_main);
    assert_eq!(code, 0);
}

// -----------------------------------------------------------------------------
// Exit codes
// -----------------------------------------------------------------------------

static EXIT_SEEN: AtomicI32 = AtomicI32::new(0);

fn exit_main(_: *mut (), _: &Framework) -> i32 {
    EXIT_SEEN.store(1, Ordering::Relaxed);
    -17
}

fn panic_main(_: *mut (), _: &Framework) -> i32 {
    panic!("main fell over");
}

#[test]
fn test_exit_code_propagates() {
    let code = run_framework(FrameworkHints::new(64 * 1024, 1, 8, 8), exit_main);
    assert_eq!(code, -17);
    assert_eq!(EXIT_SEEN.load(Ordering::Relaxed), 1);
}

#[test]
fn test_panicking_main_reports_abort_code() {
    // Roomy stacks: the panic machinery (hook, formatting) runs on the
    // fiber stack.
    let code = run_framework(FrameworkHints::new(256 * 1024, 1, 8, 8), panic_main);
    assert_eq!(code, -1, "abort paths report -1");
}
