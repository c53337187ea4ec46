//! # Kernel
//!
//! The global kernel control block and the public task API.
//!
//! ## Startup Sequence
//!
//! ```text
//! riscv-rt reset handler
//!   └─► main()
//!         ├─► arch::heap_init()        ← hand the heap to the allocator
//!         ├─► arch::init_traps()       ← install the trap vector
//!         └─► kernel::start(app_main)  ← does not return
//!               ├─► app_main()         ← spawns application tasks,
//!               │                        picks preemptive/cooperative
//!               ├─► spawn idle task
//!               ├─► save boot context, arm the tick timer
//!               └─► launch the first task
//! ```
//!
//! All public functions take the kernel critical section around their
//! access to shared state; the dispatcher runs from the timer interrupt
//! with interrupts already masked.

use alloc::boxed::Box;

use crate::arch;
use crate::config::DEFAULT_STACK_SIZE;
use crate::error::{Error, Result};
use crate::sched::{Kcb, RtPolicy};
use crate::sync::critical;
use crate::task::{Priority, TaskEntry, TaskId};
use crate::timer::{TimerCallback, TimerId, TimerMode};

// ---------------------------------------------------------------------------
// Global kernel control block
// ---------------------------------------------------------------------------

/// The singleton KCB. Constructed before any task runs, never destroyed.
///
/// # Safety
/// Mutable access goes through [`kcb_ptr`] and happens either inside a
/// critical section or from the timer interrupt with interrupts masked.
static mut KCB: Kcb = Kcb::new();

/// Raw pointer to the global KCB for the dispatch paths, which cannot
/// hold a borrow across a context switch.
#[inline]
pub(crate) fn kcb_ptr() -> *mut Kcb {
    core::ptr::addr_of_mut!(KCB)
}

/// Reset the kernel to its boot state. Must be called before any other
/// kernel function, from the boot thread only; calling it after the
/// scheduler has started is undefined.
pub fn init() {
    critical(|_| unsafe { *kcb_ptr() = Kcb::new() });
}

/// Report a fatal kernel error and halt the machine. Used for broken
/// invariants only; recoverable conditions surface as [`Error`] values.
pub(crate) fn fatal(err: Error) -> ! {
    log::error!("kernel panic ({}): {}", err.code(), err.as_str());
    arch::halt()
}

// ---------------------------------------------------------------------------
// Task API
// ---------------------------------------------------------------------------

/// Create a task with its own stack and make it schedulable.
///
/// `stack_size` is rounded up to the minimum size and 16-byte alignment.
/// Returns the new task's id. Allocator exhaustion is fatal by design:
/// the system cannot do its job without its intended tasks.
pub fn spawn(entry: TaskEntry, stack_size: usize) -> TaskId {
    critical(|_| unsafe { (*kcb_ptr()).spawn(entry, stack_size) })
}

/// Remove a task by id. The calling task and id 0 are refused.
pub fn cancel(id: TaskId) -> Result<()> {
    critical(|_| unsafe { (*kcb_ptr()).cancel(id) })
}

/// Suspend a task. Suspending the calling task yields immediately.
pub fn suspend(id: TaskId) -> Result<()> {
    let was_current = critical(|_| unsafe { (*kcb_ptr()).suspend(id) })?;
    if was_current {
        yield_now();
    }
    Ok(())
}

/// Return a suspended task to the Ready state.
pub fn resume(id: TaskId) -> Result<()> {
    critical(|_| unsafe { (*kcb_ptr()).resume(id) })
}

/// Change a task's base priority. The dynamic counter is preloaded from
/// the new base.
pub fn set_priority(id: TaskId, prio: Priority) -> Result<()> {
    critical(|_| unsafe { (*kcb_ptr()).set_priority(id, prio) })
}

/// Attach (or clear) the opaque handle consulted by the installed
/// real-time policy. Tasks carrying a handle are skipped by the
/// round-robin pass.
pub fn set_rt_priority(id: TaskId, handle: Option<usize>) -> Result<()> {
    critical(|_| unsafe { (*kcb_ptr()).set_rt_priority(id, handle) })
}

/// Install the real-time scheduling policy object.
pub fn install_rt_policy(policy: Box<dyn RtPolicy>) {
    critical(|_| unsafe { (*kcb_ptr()).install_rt_policy(policy) });
}

/// Id of the calling task (0 before the scheduler starts).
pub fn current_id() -> TaskId {
    critical(|_| unsafe { (*kcb_ptr()).current_id() })
}

/// Find a task id by entry point.
pub fn idref(entry: TaskEntry) -> Result<TaskId> {
    critical(|_| unsafe {
        let k = &*kcb_ptr();
        let slot = k.tasks.find_by_entry(entry).ok_or(Error::TaskNotFound)?;
        k.tasks.get(slot).map(|t| t.id).ok_or(Error::TaskNotFound)
    })
}

/// Number of live tasks.
pub fn task_count() -> u16 {
    critical(|_| unsafe { (*kcb_ptr()).task_count() })
}

/// Monotonic tick count since boot.
pub fn ticks() -> u64 {
    critical(|_| unsafe { (*kcb_ptr()).ticks() })
}

/// Milliseconds since boot, from the platform clock.
pub fn uptime_ms() -> u64 {
    arch::read_us() / 1000
}

/// Block the calling task for `n` ticks. `delay(0)` returns at once.
pub fn delay(n: u16) {
    if n == 0 {
        return;
    }
    critical(|_| unsafe { (*kcb_ptr()).delay_current(n) });
    yield_now();
}

/// Spin in a low-power state until the tick counter changes. Only
/// meaningful under preemptive scheduling; returns immediately in
/// cooperative mode. This returns on any tick change, so it is a
/// one-quantum pause, not a general sleep.
pub fn wfi() {
    if !critical(|_| unsafe { (*kcb_ptr()).preemptive() }) {
        return;
    }
    let start = ticks();
    while ticks() == start {
        arch::idle();
    }
}

// ---------------------------------------------------------------------------
// Software timers
// ---------------------------------------------------------------------------

/// Register a software timer. It starts disarmed; arm it with
/// [`timer_start`]. The callback runs in interrupt context and must not
/// block.
pub fn timer_create(period_ms: u32, callback: TimerCallback) -> Result<TimerId> {
    critical(|_| unsafe { (*kcb_ptr()).timers.create(period_ms, callback) })
}

/// Remove a timer entirely, disarming it first if needed.
pub fn timer_destroy(id: TimerId) -> Result<()> {
    critical(|_| unsafe { (*kcb_ptr()).timers.destroy(id) })
}

/// Arm a timer in one-shot or auto-reload mode. The first expiry is one
/// period from now.
pub fn timer_start(id: TimerId, mode: TimerMode) -> Result<()> {
    critical(|_| unsafe {
        let k = &mut *kcb_ptr();
        let now = k.ticks();
        k.timers.start(id, mode, now)
    })
}

/// Disarm a running timer without destroying it.
pub fn timer_cancel(id: TimerId) -> Result<()> {
    critical(|_| unsafe { (*kcb_ptr()).timers.cancel(id) })
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Timer-interrupt entry point: account the tick, expire software
/// timers, then run the preemptive dispatch. Called with interrupts
/// masked by the trap path.
pub fn dispatcher() {
    let k = unsafe { &mut *kcb_ptr() };
    let now = k.advance_tick();
    k.timers.tick(now);
    dispatch();
}

/// Preemptive context switch. Saves the current task's context; when
/// that save later *resumes* (nonzero return), control goes straight
/// back to the task. Otherwise: periodic stack validation, delay aging,
/// the scheduling decision, and a restore of the winner's context.
fn dispatch() {
    let k = unsafe { &mut *kcb_ptr() };
    let Some(task) = k.current_tcb_mut() else {
        fatal(Error::NoTasks);
    };
    if unsafe { arch::context_save(&mut task.context) } != 0 {
        return;
    }

    k.stack_check();
    k.age_delays();
    k.schedule_next();

    let Some(next) = k.current_tcb() else {
        fatal(Error::NoTasks);
    };
    arch::interrupt_tick(next);
    unsafe { arch::context_restore(&next.context) }
}

/// Voluntarily hand the CPU to the scheduler (the cooperative point).
///
/// Delay aging runs here only in cooperative mode; under preemption the
/// tick handler owns it.
pub fn yield_now() {
    arch::interrupt_disable();
    let k = unsafe { &mut *kcb_ptr() };
    let Some(task) = k.current_tcb_mut() else {
        arch::interrupt_enable();
        return;
    };
    if unsafe { arch::context_save(&mut task.context) } != 0 {
        arch::interrupt_enable();
        return;
    }

    k.stack_check();
    if !k.preemptive() {
        k.age_delays();
    }
    k.schedule_next();

    let Some(next) = k.current_tcb() else {
        fatal(Error::NoTasks);
    };
    arch::interrupt_tick(next);
    unsafe { arch::context_restore(&next.context) }
}

// ---------------------------------------------------------------------------
// Boot
// ---------------------------------------------------------------------------

extern "C" fn idle_task() -> ! {
    loop {
        wfi();
    }
}

/// Bring the scheduler up and launch the first task. **Does not return.**
///
/// `app_main` must spawn at least one task; its return value selects
/// preemptive (`true`) or cooperative (`false`) scheduling. The idle
/// task is spawned unconditionally so the selection pass always finds a
/// runnable task.
pub fn start(app_main: fn() -> bool) -> ! {
    let preemptive = app_main();
    critical(|_| unsafe { (*kcb_ptr()).set_preemptive(preemptive) });
    log::info!(
        "scheduler mode: {}",
        if preemptive { "preemptive" } else { "cooperative" }
    );

    if task_count() == 0 {
        fatal(Error::NoTasks);
    }

    let idle_id = spawn(idle_task, DEFAULT_STACK_SIZE);
    if set_priority(idle_id, Priority::Idle).is_err() {
        fatal(Error::Unknown);
    }

    unsafe {
        let k = &mut *kcb_ptr();
        // Establish a base context for the boot thread before handing
        // the CPU to the first task.
        if arch::context_save(&mut k.boot_context) == 0 {
            if k.preemptive() {
                arch::timer_enable();
            }
            let Some(first) = k.current_tcb_mut() else {
                fatal(Error::NoTasks);
            };
            first.state = crate::task::TaskState::Running;
            arch::launch_first(&first.context);
        }
    }

    // The boot context is never resumed.
    fatal(Error::Unknown)
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as HostMutex;

    // The public API funnels into one global KCB; serialize the tests
    // that touch it and reset it for each.
    static KERNEL_TEST_LOCK: HostMutex<()> = HostMutex::new(());

    fn with_fresh_kernel<R>(f: impl FnOnce() -> R) -> R {
        let _guard = KERNEL_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        init();
        f()
    }

    extern "C" fn task_a() -> ! {
        loop {}
    }
    extern "C" fn task_b() -> ! {
        loop {}
    }

    #[test]
    fn test_spawn_assigns_ids_and_counts() {
        with_fresh_kernel(|| {
            assert_eq!(task_count(), 0);
            let a = spawn(task_a, 1024);
            let b = spawn(task_b, 1024);
            assert_ne!(a, 0);
            assert_ne!(a, b);
            assert_eq!(task_count(), 2);
        });
    }

    #[test]
    fn test_idref_finds_tasks_by_entry() {
        with_fresh_kernel(|| {
            let a = spawn(task_a, 1024);
            let b = spawn(task_b, 1024);
            assert_eq!(idref(task_a), Ok(a));
            assert_eq!(idref(task_b), Ok(b));
        });
    }

    #[test]
    fn test_idref_unknown_entry() {
        with_fresh_kernel(|| {
            spawn(task_a, 1024);
            assert_eq!(idref(task_b), Err(Error::TaskNotFound));
        });
    }

    #[test]
    fn test_suspend_resume_of_non_current_task() {
        with_fresh_kernel(|| {
            spawn(task_a, 1024);
            let b = spawn(task_b, 1024);
            // b is not the current task, so no yield happens.
            assert_eq!(suspend(b), Ok(()));
            assert_eq!(resume(b), Ok(()));
            assert_eq!(resume(b), Err(Error::TaskCantResume));
        });
    }

    #[test]
    fn test_cancel_api() {
        with_fresh_kernel(|| {
            spawn(task_a, 1024);
            let b = spawn(task_b, 1024);
            assert_eq!(cancel(b), Ok(()));
            assert_eq!(cancel(b), Err(Error::TaskNotFound));
            assert_eq!(task_count(), 1);
        });
    }

    #[test]
    fn test_priority_api() {
        with_fresh_kernel(|| {
            let a = spawn(task_a, 1024);
            assert_eq!(set_priority(a, Priority::High), Ok(()));
            assert_eq!(set_priority(99, Priority::High), Err(Error::TaskNotFound));
            assert_eq!(set_rt_priority(a, Some(3)), Ok(()));
            assert_eq!(set_rt_priority(a, None), Ok(()));
        });
    }

    #[test]
    fn test_ticks_start_at_zero() {
        with_fresh_kernel(|| {
            assert_eq!(ticks(), 0);
            assert_eq!(current_id(), 0);
        });
    }

    #[test]
    fn test_delay_zero_is_a_no_op() {
        with_fresh_kernel(|| {
            spawn(task_a, 1024);
            // Must return without trying to context-switch.
            delay(0);
        });
    }

    #[test]
    fn test_timer_api_lifecycle() {
        use alloc::boxed::Box;

        with_fresh_kernel(|| {
            let id = timer_create(10, Box::new(|| {})).unwrap();
            assert_eq!(timer_cancel(id), Err(Error::Fail));
            assert_eq!(timer_start(id, TimerMode::AutoReload), Ok(()));
            assert_eq!(timer_cancel(id), Ok(()));
            assert_eq!(timer_destroy(id), Ok(()));
            assert_eq!(timer_destroy(id), Err(Error::Fail));
        });
    }
}
