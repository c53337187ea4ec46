//! # Error Taxonomy
//!
//! Two tiers of failure:
//!
//! 1. **Recoverable** — returned as `Err(Error)` from API calls:
//!    contention (`TaskBusy`, `Timeout`), argument errors
//!    (`TaskNotFound`, `TaskInvalidPrio`), ordering violations
//!    (`NotOwner`). Callers handle these locally.
//! 2. **Fatal** — broken kernel invariants (no runnable task, corrupt
//!    stack canary, invalid object sentinel, wait-queue overflow). These
//!    go through [`crate::kernel::fatal`], which reports the numeric
//!    code and halts the machine.
//!
//! The numeric codes are stable and part of the kernel ABI; success is
//! code 0 and is represented by `Ok(..)`.

/// Kernel error codes. The discriminants are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Error {
    /// Generic failure (invalid argument or object).
    Fail = 1,
    /// Unclassified internal error.
    Unknown = 2,
    /// No runnable task exists.
    NoTasks = 3,
    /// Stack canary mismatch.
    StackCheck = 4,
    /// Heap exhausted during kernel bring-up.
    NoHeap = 5,
    /// Task cannot be cancelled (running, or is the caller).
    TaskCantRemove = 6,
    /// Task is not in a suspendable state.
    TaskCantSuspend = 7,
    /// Task is not suspended.
    TaskCantResume = 8,
    /// Priority value is not one of the recognized bases.
    TaskInvalidPrio = 9,
    /// No task with the given id.
    TaskNotFound = 10,
    /// Object is owned or has waiters.
    TaskBusy = 11,
    /// Invalid operation on a synchronization object.
    SemOperation = 12,
    /// Message queue still holds messages.
    MqNotEmpty = 13,
    /// Caller does not own the mutex.
    NotOwner = 14,
    /// Timed wait expired.
    Timeout = 15,
    /// Kernel control block allocation failed.
    KcbAlloc = 16,
    /// Task control block allocation failed.
    TcbAlloc = 17,
    /// Task stack allocation failed.
    StackAlloc = 18,
}

impl Error {
    /// Stable integer code.
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Short human-readable description, used by the panic path.
    pub const fn as_str(self) -> &'static str {
        match self {
            Error::Fail => "operation failed",
            Error::Unknown => "unknown error",
            Error::NoTasks => "no runnable tasks",
            Error::StackCheck => "stack corruption detected",
            Error::NoHeap => "heap exhausted",
            Error::TaskCantRemove => "task cannot be removed",
            Error::TaskCantSuspend => "task cannot be suspended",
            Error::TaskCantResume => "task cannot be resumed",
            Error::TaskInvalidPrio => "invalid task priority",
            Error::TaskNotFound => "task not found",
            Error::TaskBusy => "object busy",
            Error::SemOperation => "invalid semaphore operation",
            Error::MqNotEmpty => "message queue not empty",
            Error::NotOwner => "caller does not own mutex",
            Error::Timeout => "operation timed out",
            Error::KcbAlloc => "kernel control block allocation failed",
            Error::TcbAlloc => "task control block allocation failed",
            Error::StackAlloc => "stack allocation failed",
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.code())
    }
}

/// Result alias used throughout the kernel.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable_and_distinct() {
        let all = [
            Error::Fail,
            Error::Unknown,
            Error::NoTasks,
            Error::StackCheck,
            Error::NoHeap,
            Error::TaskCantRemove,
            Error::TaskCantSuspend,
            Error::TaskCantResume,
            Error::TaskInvalidPrio,
            Error::TaskNotFound,
            Error::TaskBusy,
            Error::SemOperation,
            Error::MqNotEmpty,
            Error::NotOwner,
            Error::Timeout,
            Error::KcbAlloc,
            Error::TcbAlloc,
            Error::StackAlloc,
        ];
        for (i, e) in all.iter().enumerate() {
            assert_eq!(e.code(), i as i32 + 1);
        }
    }

    #[test]
    fn test_display_includes_code() {
        use std::string::ToString;
        assert_eq!(Error::Timeout.to_string(), "operation timed out (15)");
    }
}
