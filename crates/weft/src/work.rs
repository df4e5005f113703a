//! Work descriptors.

use std::fmt;

/// A work function: receives the opaque data pointer of its [`Work`]
/// descriptor. Failure is communicated through the data, never by unwinding;
/// a panic that escapes a work function is caught, logged and treated as
/// completion.
pub type WorkFn = fn(*mut ());

/// Controls how the scheduler distributes a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i8)]
pub enum Schedule {
    /// No implications for the scheduler; runs on any worker.
    #[default]
    Default = 0,
    /// Important work; drained ahead of default-class work on every worker.
    Aggressive,
    /// May only ever run on worker 0 (the `framework_main` thread).
    MainAffinity,
}

/// Details of one work item to be executed by the job system.
///
/// Immutable once submitted. The descriptor is `Copy`; submission copies it
/// into the executing fiber, so the array handed to
/// [`submit`](crate::submit) may live on the caller's stack (or in drifter
/// memory).
#[derive(Clone, Copy)]
pub struct Work {
    /// Work to run.
    pub func: WorkFn,
    /// Data for the work.
    pub data: *mut (),
    /// Minimal stack size required to run this work; 0 selects the default.
    pub stack_size: usize,
    /// Scheduling class.
    pub schedule: Schedule,
    /// Adopted by the executing fiber for profiling and logs.
    pub name: Option<&'static str>,
}

// Safety: the descriptor itself is plain data; the *user* contract that
// `data` is safe to touch from another thread is part of `submit`'s safety
// requirements.
unsafe impl Send for Work {}

impl Work {
    /// A work item with default stack, default scheduling and no name.
    pub fn new(func: WorkFn, data: *mut ()) -> Self {
        Self {
            func,
            data,
            stack_size: 0,
            schedule: Schedule::Default,
            name: None,
        }
    }

    /// Sets the minimum stack size hint.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Sets the scheduling class.
    pub fn schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Sets the debug name.
    pub fn name(mut self, name: &'static str) -> Self {
        self.name = Some(name);
        self
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Work")
            .field("func", &(self.func as usize as *const ()))
            .field("data", &self.data)
            .field("stack_size", &self.stack_size)
            .field("schedule", &self.schedule)
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: *mut ()) {}

    #[test]
    fn test_builder_chain() {
        let work = Work::new(noop, std::ptr::null_mut())
            .stack_size(256 * 1024)
            .schedule(Schedule::MainAffinity)
            .name("upload");

        assert_eq!(work.stack_size, 256 * 1024);
        assert_eq!(work.schedule, Schedule::MainAffinity);
        assert_eq!(work.name, Some("upload"));
    }
}
