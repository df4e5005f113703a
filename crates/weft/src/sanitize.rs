//! Assertion reporting.
//!
//! Failed runtime assertions are routed through a process-wide sink that
//! decides how to proceed. The default sink logs the failure and asks for an
//! abort with a stack trace; embedders (and tests) can install their own sink
//! to downgrade or capture failures.

use std::sync::RwLock;

/// Verdict returned by an assertion sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum AssertStatus {
    /// Carry on; the caller treats the assertion as a logged diagnostic.
    Continue = 0,
    /// Panic at the assertion site (unwinds into a debugger or test harness).
    Trap,
    /// Dump a stack trace and abort the process.
    Abort,
}

/// A report handed to the sink for every failed assertion.
#[derive(Debug)]
pub struct AssertFailure<'a> {
    /// Stringified condition that failed.
    pub condition: &'a str,
    pub file: &'static str,
    pub line: u32,
    /// Formatted caller message, empty when none was given.
    pub message: &'a str,
}

/// Sink signature. Must not call back into the assertion machinery.
pub type AssertSink = fn(&AssertFailure<'_>) -> AssertStatus;

fn default_sink(failure: &AssertFailure<'_>) -> AssertStatus {
    log::error!(
        "assertion failed: {} at {}:{} {}",
        failure.condition,
        failure.file,
        failure.line,
        failure.message
    );
    AssertStatus::Abort
}

static SINK: RwLock<AssertSink> = RwLock::new(default_sink);

/// Replaces the process-wide assertion sink, returning the previous one.
pub fn set_assert_sink(sink: AssertSink) -> AssertSink {
    let mut slot = SINK.write().unwrap_or_else(std::sync::PoisonError::into_inner);
    std::mem::replace(&mut *slot, sink)
}

/// Reports a failure to the current sink and honours its verdict.
///
/// Called by [`weft_assert!`](crate::weft_assert); public so the macro can
/// reach it from other crates.
#[cold]
pub fn assert_failed(failure: &AssertFailure<'_>) {
    let sink = *SINK.read().unwrap_or_else(std::sync::PoisonError::into_inner);
    match sink(failure) {
        AssertStatus::Continue => {}
        AssertStatus::Trap => {
            panic!(
                "assertion failed: {} at {}:{} {}",
                failure.condition, failure.file, failure.line, failure.message
            );
        }
        AssertStatus::Abort => {
            let mut trace = String::new();
            let _ = crate::host::dump_stack_trace(&mut trace);
            eprintln!(
                "assertion failed: {} at {}:{} {}\n{}",
                failure.condition, failure.file, failure.line, failure.message, trace
            );
            std::process::abort();
        }
    }
}

/// Runtime assertion honouring the process assertion sink.
///
/// Active in every build profile; the debug-only invariant checks use plain
/// `debug_assert!` instead.
#[macro_export]
macro_rules! weft_assert {
    ($cond:expr) => {
        $crate::weft_assert!($cond, "");
    };
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            $crate::sanitize::assert_failed(&$crate::sanitize::AssertFailure {
                condition: stringify!($cond),
                file: file!(),
                line: line!(),
                message: &format!($($arg)*),
            });
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static CONTINUES: AtomicUsize = AtomicUsize::new(0);

    fn counting_sink(_failure: &AssertFailure<'_>) -> AssertStatus {
        CONTINUES.fetch_add(1, Ordering::SeqCst);
        AssertStatus::Continue
    }

    fn trap_sink(_: &AssertFailure<'_>) -> AssertStatus {
        AssertStatus::Trap
    }

    // One test body: the sink is process-wide state and the test harness runs
    // tests concurrently.
    #[test]
    fn test_sink_verdicts() {
        let previous = set_assert_sink(counting_sink);

        weft_assert!(1 + 1 == 3, "arithmetic drifted");
        assert_eq!(CONTINUES.load(Ordering::SeqCst), 1);

        weft_assert!(true, "never reported");
        assert_eq!(CONTINUES.load(Ordering::SeqCst), 1);

        set_assert_sink(trap_sink);
        let result = std::panic::catch_unwind(|| weft_assert!(false, "boom"));
        assert!(result.is_err());

        set_assert_sink(previous);
    }
}
