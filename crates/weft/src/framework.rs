use crate::host;
use crate::scheduler::{self, Engine};
use crate::work::{Schedule, Work};
use crate::{defer, weft_assert};
use std::sync::atomic::Ordering;
use std::thread;
use thiserror::Error;

/// Errors surfaced by [`try_framework_main`]. The `framework_main` wrapper
/// maps every error to the abort exit code −1.
#[derive(Debug, Error)]
pub enum FrameworkError {
    /// Worker thread creation failed; the framework cannot run.
    #[error("worker thread creation failed: {0}")]
    ThreadSpawn(#[from] std::io::Error),
    /// Another `framework_main` already brackets the process.
    #[error("the job system is already running in this process")]
    AlreadyRunning,
}

/// Tuning knobs for the job system. Zero means "use the default" where a
/// zero value would be degenerate.
#[derive(Debug, Clone, Copy)]
pub struct FrameworkHints {
    /// Stack size for fibers whose descriptor requests 0.
    pub default_stack_size: usize,
    /// Worker count; 0 selects the host logical CPU count.
    pub thread_count: u32,
    /// Fiber pool size.
    pub fiber_count: u32,
    /// Ready-ring capacity exponent; capacity is `2^log2_work_count`.
    pub log2_work_count: u32,
}

impl FrameworkHints {
    /// Creates hints with explicit values.
    ///
    /// # Panics
    ///
    /// Panics if `default_stack_size` is under 4 KiB, `fiber_count` is 0 or
    /// exceeds the ready-ring capacity, or `log2_work_count` is outside
    /// `[4, 20]`.
    pub const fn new(
        default_stack_size: usize,
        thread_count: u32,
        fiber_count: u32,
        log2_work_count: u32,
    ) -> Self {
        assert!(default_stack_size >= 4 * 1024, "default stack size is degenerately small");
        assert!(fiber_count > 0, "the fiber pool cannot be empty");
        assert!(
            log2_work_count >= 4 && log2_work_count <= 20,
            "log2_work_count must be between 4 and 20"
        );
        // Ready rings carry fiber indices, so a pool no larger than the ring
        // can never wedge an enqueue.
        assert!(
            fiber_count as u64 <= 1 << log2_work_count,
            "fiber_count must not exceed the ready-ring capacity"
        );
        Self {
            default_stack_size,
            thread_count,
            fiber_count,
            log2_work_count,
        }
    }
}

impl Default for FrameworkHints {
    fn default() -> Self {
        Self::new(64 * 1024, 0, 128, 12)
    }
}

/// Host introspection snapshot, filled by `framework_main` at bootstrap.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameworkHost {
    /// Real-time clock counter at bootstrap.
    pub timer_begin: u64,
    /// Total physical memory in bytes.
    pub total_ram: usize,
    /// VM page size in use.
    pub page_size_in_use: usize,
    /// Bitmask of available hugetlb entry sizes.
    pub hugepage_sizes: host::HugepageSizes,
    pub cpu_thread_count: i32,
    pub cpu_cores_count: i32,
    pub cpu_package_count: i32,
}

/// Identity, configuration and host snapshot handed to the application's
/// main function.
#[derive(Debug, Clone, Default)]
pub struct Framework {
    pub engine_name: &'static str,
    pub app_name: &'static str,
    pub engine_version: u32,
    pub app_version: u32,
    /// Command-line arguments, if the embedder forwards them.
    pub args: Vec<String>,
    pub hints: FrameworkHints,
    pub host: FrameworkHost,
}

/// Application entry signature: opaque user data plus the filled-in
/// framework description. The return value becomes the process exit code.
pub type MainFn = fn(*mut (), &Framework) -> i32;

struct MainRun {
    main_fn: MainFn,
    main_data: *mut (),
    framework: *const Framework,
}

fn run_main(data: *mut ()) {
    // SAFETY: `data` points at the MainRun on framework_main's stack, which
    // outlives every worker.
    let run = unsafe { &*data.cast::<MainRun>() };
    let engine = scheduler::engine();
    // Shutdown must happen even if main panics; exit_code then stays -1.
    defer!(engine.shutdown.store(true, Ordering::Release));
    // SAFETY: as above.
    let framework = unsafe { &*run.framework };
    let code = (run.main_fn)(run.main_data, framework);
    engine.exit_code.store(code, Ordering::Release);
}

/// Bootstraps the job system, runs `main_fn` as a main-affinity work item on
/// worker 0, and tears everything down after all workers join.
///
/// Returns `main_fn`'s exit code; abort paths return −1.
pub fn framework_main(main_fn: MainFn, main_data: *mut (), framework: &mut Framework) -> i32 {
    match try_framework_main(main_fn, main_data, framework) {
        Ok(code) => code,
        Err(error) => {
            log::error!("framework_main aborted: {error}");
            -1
        }
    }
}

/// [`framework_main`] with the fatal bootstrap errors surfaced instead of
/// mapped to −1.
pub fn try_framework_main(
    main_fn: MainFn,
    main_data: *mut (),
    framework: &mut Framework,
) -> Result<i32, FrameworkError> {
    if scheduler::is_installed() {
        return Err(FrameworkError::AlreadyRunning);
    }

    framework.host = snapshot_host();
    let hints = framework.hints;
    let thread_count = resolve_thread_count(hints.thread_count, framework.host.cpu_thread_count);

    log::debug!(
        "framework bootstrap: {} workers, {} fibers, ready ring 2^{}",
        thread_count,
        hints.fiber_count,
        hints.log2_work_count
    );

    scheduler::install(Engine::new(
        hints.default_stack_size,
        thread_count,
        hints.fiber_count,
        hints.log2_work_count,
    ));
    let engine: &'static Engine = scheduler::engine();

    // From here on the framework is mutated no further; main only reads it.
    let framework: &Framework = framework;

    let mut handles = Vec::with_capacity(engine.thread_count as usize - 1);
    for index in 1..engine.thread_count {
        let spawned = thread::Builder::new()
            .name(format!("weft-worker-{index}"))
            .spawn(move || {
                pin_thread(index as usize);
                scheduler::worker_loop(engine, index as i32);
            });
        match spawned {
            Ok(handle) => handles.push(handle),
            Err(error) => {
                // Fatal: release the workers that did start, then bail.
                engine.shutdown.store(true, Ordering::Release);
                join_workers(handles);
                drop(scheduler::teardown());
                return Err(FrameworkError::ThreadSpawn(error));
            }
        }
    }
    pin_thread(0);

    let run = MainRun {
        main_fn,
        main_data,
        framework,
    };
    let main_work = Work::new(run_main, std::ptr::from_ref(&run).cast_mut().cast())
        .schedule(Schedule::MainAffinity)
        .name("main");
    // SAFETY: `run` lives on this stack until all workers join below.
    let _ = unsafe { scheduler::submit(&[main_work]) };

    scheduler::worker_loop(engine, 0);
    join_workers(handles);

    let engine = scheduler::teardown();
    weft_assert!(
        engine.free_fiber_count() == engine.fiber_count as usize,
        "fibers leaked across framework shutdown"
    );
    let code = engine.exit_code.load(Ordering::Acquire);
    drop(engine);
    Ok(code)
}

fn join_workers(handles: Vec<thread::JoinHandle<()>>) {
    for handle in handles {
        if handle.join().is_err() {
            log::error!("a worker thread panicked during shutdown");
        }
    }
}

fn resolve_thread_count(requested: u32, host_threads: i32) -> u32 {
    let host_threads = host_threads.max(1) as u32;
    if requested == 0 {
        host_threads
    } else {
        requested.clamp(1, host_threads)
    }
}

fn snapshot_host() -> FrameworkHost {
    let cpu = host::cpuinfo();
    let mut total_ram = 0;
    let hugepage_sizes = host::hugetlbinfo(&mut total_ram);
    FrameworkHost {
        timer_begin: host::rtc_counter(),
        total_ram,
        page_size_in_use: host::page_size(),
        hugepage_sizes,
        cpu_thread_count: cpu.thread_count,
        cpu_cores_count: cpu.core_count,
        cpu_package_count: cpu.package_count,
    }
}

/// Best-effort CPU pinning; failure is silent apart from a debug log.
#[cfg(target_os = "linux")]
fn pin_thread(cpu: usize) {
    // SAFETY: a zeroed cpu_set_t is a valid empty set; pthread_self() is the
    // calling thread.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(cpu % libc::CPU_SETSIZE as usize, &mut set);
        let rc = libc::pthread_setaffinity_np(
            libc::pthread_self(),
            size_of::<libc::cpu_set_t>(),
            &set,
        );
        if rc != 0 {
            log::debug!("cpu affinity for cpu {cpu} not applied (errno {rc})");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_thread(_cpu: usize) {}
