//! # Scheduler
//!
//! Weighted round-robin scheduling with dynamic priority aging, plus
//! the single blocking primitive every synchronization object is built
//! on.
//!
//! ## Selection Algorithm
//!
//! On every dispatch the scheduler walks the circular task ring starting
//! just after the current task. For each Ready task (skipping tasks
//! claimed by an installed real-time policy) it decrements the dynamic
//! priority counter, saturating at zero; the first task whose counter
//! reaches zero is selected and its counter reloaded from its base
//! weight. Tasks with a low base weight therefore win proportionally
//! more passes, and equal-weight tasks alternate in ring (creation)
//! order, which is the FIFO tie-break.
//!
//! The last selected ring slot is cached as a hint: if it is still Ready
//! with a zero counter on the next pass it is taken immediately.
//!
//! A pass is bounded by [`SCHED_IMAX`] ring steps; exhausting the bound
//! means no task is runnable, which is fatal — the idle task spawned at
//! boot guarantees this cannot happen in a healthy system.
//!
//! ## Blocking
//!
//! [`Kcb::block_current`] appends the current task to a wait queue and
//! marks it Blocked; the caller yields as soon as the enclosing critical
//! section ends. Wakers transfer the contested resource directly to the
//! task they pop (the semaphore count is not re-incremented, the mutex
//! owner is set to the wakee), so no third task can steal it between
//! signal and resume.

use alloc::boxed::Box;
use alloc::collections::VecDeque;

use crate::arch::{self, Context};
use crate::config::{SCHED_IMAX, STACK_CHECK_INTERVAL};
use crate::error::Error;
use crate::kernel::fatal;
use crate::list::TaskList;
use crate::task::{Priority, TaskEntry, TaskId, TaskState, TaskStack, Tcb};
use crate::timer::Timers;

// ---------------------------------------------------------------------------
// Real-time policy hook
// ---------------------------------------------------------------------------

/// Replaceable real-time scheduling policy. At most one policy is
/// installed; on every dispatch it is offered the decision before the
/// weighted round-robin pass runs. Returning `None` declines.
///
/// The policy sees the whole task list and returns the ring slot of the
/// task to run. Only tasks carrying an `rt_prio` handle are its
/// business; the round-robin pass skips those unconditionally.
pub trait RtPolicy: Send {
    fn select(&mut self, tasks: &mut TaskList) -> Option<usize>;
}

// ---------------------------------------------------------------------------
// Wait queues
// ---------------------------------------------------------------------------

/// FIFO queue of blocked task ids with a fixed capacity, owned by a
/// synchronization object. Holds ids, never TCBs: the task registry
/// keeps ownership.
pub struct WaitQueue {
    queue: VecDeque<TaskId>,
    capacity: usize,
}

impl WaitQueue {
    pub fn with_capacity(capacity: usize) -> WaitQueue {
        WaitQueue {
            queue: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// A queue with no waiter bound (mutexes and condition variables
    /// accept as many waiters as there are tasks).
    pub fn unbounded() -> WaitQueue {
        WaitQueue {
            queue: VecDeque::new(),
            capacity: usize::MAX,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.capacity
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.queue.contains(&id)
    }

    /// Remove a specific waiter (timed waits that expired remove
    /// themselves). Returns whether the id was present.
    pub fn remove(&mut self, id: TaskId) -> bool {
        let before = self.queue.len();
        self.queue.retain(|&t| t != id);
        self.queue.len() != before
    }

    pub(crate) fn push(&mut self, id: TaskId) -> core::result::Result<(), ()> {
        if self.is_full() {
            return Err(());
        }
        self.queue.push_back(id);
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Option<TaskId> {
        self.queue.pop_front()
    }
}

// ---------------------------------------------------------------------------
// Kernel Control Block
// ---------------------------------------------------------------------------

/// The kernel's global state: master task ring, scheduler bookkeeping,
/// the software timer registry and the monotonic tick counter. A single
/// instance lives for the lifetime of the system (see `kernel`).
pub struct Kcb {
    /// Master task ring.
    pub tasks: TaskList,
    /// Ring slot of the currently running task.
    current: Option<usize>,
    /// Saved context of the boot thread.
    pub boot_context: Context,
    /// Monotonic id for the next spawned task; 0 is reserved invalid.
    next_tid: TaskId,
    /// Preemptive (tick-driven) vs cooperative (yield-driven) mode.
    preemptive: bool,
    /// Last selected ready slot, checked first on the next pass.
    last_ready_hint: Option<usize>,
    rt_policy: Option<Box<dyn RtPolicy>>,
    /// Software timer registry, driven from the tick path.
    pub timers: Timers,
    ticks: u64,
    stack_check_counter: u32,
}

impl Kcb {
    pub const fn new() -> Kcb {
        Kcb {
            tasks: TaskList::new(),
            current: None,
            boot_context: Context::new(),
            next_tid: 1,
            preemptive: true,
            last_ready_hint: None,
            rt_policy: None,
            timers: Timers::new(),
            ticks: 0,
            stack_check_counter: 0,
        }
    }

    // -- Time -------------------------------------------------------------

    #[inline]
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Advance the tick counter. Called once per timer interrupt.
    #[inline]
    pub fn advance_tick(&mut self) -> u64 {
        self.ticks += 1;
        self.ticks
    }

    #[inline]
    pub fn preemptive(&self) -> bool {
        self.preemptive
    }

    pub fn set_preemptive(&mut self, preemptive: bool) {
        self.preemptive = preemptive;
    }

    /// Install the real-time policy object, replacing any previous one.
    pub fn install_rt_policy(&mut self, policy: Box<dyn RtPolicy>) {
        self.rt_policy = Some(policy);
    }

    // -- Current task -----------------------------------------------------

    #[inline]
    pub fn current_slot(&self) -> Option<usize> {
        self.current
    }

    pub fn current_tcb(&self) -> Option<&Tcb> {
        self.tasks.get(self.current?)
    }

    pub fn current_tcb_mut(&mut self) -> Option<&mut Tcb> {
        let slot = self.current?;
        self.tasks.get_mut(slot)
    }

    /// Id of the running task, or 0 before the scheduler starts.
    pub fn current_id(&self) -> TaskId {
        self.current_tcb().map_or(0, |t| t.id)
    }

    // -- Task lifecycle ---------------------------------------------------

    /// Create a task and make it Ready. Allocation failure is fatal:
    /// the system is too small to proceed without its intended tasks.
    pub fn spawn(&mut self, entry: TaskEntry, stack_size: usize) -> TaskId {
        let Some(stack) = TaskStack::new(stack_size) else {
            fatal(Error::StackAlloc);
        };

        let mut tcb = Tcb::new(entry, stack);
        let id = self.next_tid;
        self.next_tid = self.next_tid.wrapping_add(1);
        if self.next_tid == 0 {
            self.next_tid = 1;
        }
        tcb.id = id;

        arch::context_init(
            &mut tcb.context,
            tcb.stack.base_addr(),
            tcb.stack.size(),
            entry as usize,
        );

        log::info!(
            "task {}: entry={:#x} stack={:#x} size={}",
            id,
            entry as usize,
            tcb.stack.base_addr(),
            tcb.stack.size()
        );

        tcb.state = TaskState::Ready;
        let slot = self.tasks.insert(tcb);
        if self.current.is_none() {
            self.current = Some(slot);
        }
        id
    }

    /// Remove a task. The running task and id 0 are refused.
    pub fn cancel(&mut self, id: TaskId) -> crate::error::Result<()> {
        if id == 0 || id == self.current_id() {
            return Err(Error::TaskCantRemove);
        }
        let slot = self.tasks.find_by_id(id).ok_or(Error::TaskNotFound)?;
        if self.tasks.get(slot).is_some_and(|t| t.state == TaskState::Running) {
            return Err(Error::TaskCantRemove);
        }
        if self.last_ready_hint == Some(slot) {
            self.last_ready_hint = None;
        }
        self.tasks.remove(slot);
        log::info!("task {id} cancelled");
        Ok(())
    }

    /// Suspend a task. Returns `true` when the caller suspended itself
    /// and must yield immediately.
    pub fn suspend(&mut self, id: TaskId) -> crate::error::Result<bool> {
        if id == 0 {
            return Err(Error::TaskNotFound);
        }
        let slot = self.tasks.find_by_id(id).ok_or(Error::TaskNotFound)?;
        let task = self.tasks.get_mut(slot).ok_or(Error::TaskNotFound)?;
        match task.state {
            TaskState::Ready | TaskState::Running | TaskState::Blocked => {
                task.state = TaskState::Suspended;
            }
            _ => return Err(Error::TaskCantSuspend),
        }
        if self.last_ready_hint == Some(slot) {
            self.last_ready_hint = None;
        }
        Ok(self.current == Some(slot))
    }

    pub fn resume(&mut self, id: TaskId) -> crate::error::Result<()> {
        if id == 0 {
            return Err(Error::TaskNotFound);
        }
        let slot = self.tasks.find_by_id(id).ok_or(Error::TaskNotFound)?;
        let task = self.tasks.get_mut(slot).ok_or(Error::TaskNotFound)?;
        if task.state != TaskState::Suspended {
            return Err(Error::TaskCantResume);
        }
        task.state = TaskState::Ready;
        Ok(())
    }

    pub fn set_priority(&mut self, id: TaskId, prio: Priority) -> crate::error::Result<()> {
        if id == 0 {
            return Err(Error::TaskInvalidPrio);
        }
        let slot = self.tasks.find_by_id(id).ok_or(Error::TaskNotFound)?;
        let task = self.tasks.get_mut(slot).ok_or(Error::TaskNotFound)?;
        task.set_priority(prio);
        Ok(())
    }

    pub fn set_rt_priority(&mut self, id: TaskId, handle: Option<usize>) -> crate::error::Result<()> {
        if id == 0 {
            return Err(Error::TaskNotFound);
        }
        let slot = self.tasks.find_by_id(id).ok_or(Error::TaskNotFound)?;
        let task = self.tasks.get_mut(slot).ok_or(Error::TaskNotFound)?;
        task.rt_prio = handle;
        Ok(())
    }

    pub fn task_count(&self) -> u16 {
        self.tasks.len() as u16
    }

    // -- Delays and blocking ----------------------------------------------

    /// Put the current task to sleep for `ticks`. The caller yields
    /// after the enclosing critical section ends.
    pub fn delay_current(&mut self, ticks: u16) {
        if ticks == 0 {
            return;
        }
        let Some(task) = self.current_tcb_mut() else {
            return;
        };
        task.delay = ticks;
        task.state = TaskState::Blocked;
    }

    /// Age every delayed task by one tick; tasks whose delay reaches
    /// zero become Ready.
    pub fn age_delays(&mut self) {
        for task in self.tasks.iter_mut() {
            if task.state == TaskState::Blocked && task.delay > 0 {
                task.delay -= 1;
                if task.delay == 0 {
                    task.state = TaskState::Ready;
                }
            }
        }
    }

    /// The blocking primitive: append the current task to `wait_q` and
    /// mark it Blocked. Must run inside the owning object's critical
    /// section; the caller yields immediately after the section ends.
    /// A full queue or a missing current task is fatal.
    pub fn block_current(&mut self, wait_q: &mut WaitQueue) {
        let Some(task) = self.current_tcb_mut() else {
            fatal(Error::SemOperation);
        };
        let id = task.id;
        task.state = TaskState::Blocked;
        if wait_q.push(id).is_err() {
            fatal(Error::SemOperation);
        }
    }

    /// Wake the oldest waiter on `wait_q`, transferring whatever the
    /// caller hands off (a semaphore token, mutex ownership) to it.
    /// Returns the woken task's id. A waiter that is not Blocked means a
    /// corrupted wait list and is fatal.
    pub fn wake_one(&mut self, wait_q: &mut WaitQueue) -> Option<TaskId> {
        let id = wait_q.pop()?;
        let Some(task) = self.tasks.find_by_id(id).and_then(|s| self.tasks.get_mut(s)) else {
            // An id with no task behind it means the wait list is
            // corrupt.
            fatal(Error::SemOperation);
        };
        if task.state != TaskState::Blocked {
            fatal(Error::SemOperation);
        }
        task.state = TaskState::Ready;
        Some(id)
    }

    // -- Selection --------------------------------------------------------

    /// One full scheduling decision: mark the preempted task Ready, let
    /// the real-time policy bid, otherwise run the weighted round-robin
    /// pass. Returns the id of the task now Running.
    pub fn schedule_next(&mut self) -> TaskId {
        let Some(current) = self.current else {
            fatal(Error::NoTasks);
        };
        if let Some(task) = self.tasks.get_mut(current) {
            if task.state == TaskState::Running {
                task.state = TaskState::Ready;
            }
        }

        let next = self
            .rt_select()
            .or_else(|| self.find_next_ready())
            .unwrap_or_else(|| fatal(Error::NoTasks));

        self.current = Some(next);
        let Some(task) = self.tasks.get_mut(next) else {
            fatal(Error::NoTasks);
        };
        task.state = TaskState::Running;
        task.id
    }

    fn rt_select(&mut self) -> Option<usize> {
        let policy = self.rt_policy.as_mut()?;
        let slot = policy.select(&mut self.tasks)?;
        self.tasks.get(slot)?;
        Some(slot)
    }

    /// Weighted round-robin pass with priority aging and hint fast path.
    fn find_next_ready(&mut self) -> Option<usize> {
        let current = self.current?;

        if let Some(hint) = self.last_ready_hint {
            if let Some(task) = self.tasks.get_mut(hint) {
                if task.state == TaskState::Ready
                    && task.rt_prio.is_none()
                    && task.prio_counter() == 0
                {
                    task.reload_counter();
                    return Some(hint);
                }
            } else {
                self.last_ready_hint = None;
            }
        }

        let mut node = current;
        for _ in 0..SCHED_IMAX {
            node = self.tasks.next_of(node);
            let Some(task) = self.tasks.get_mut(node) else {
                break;
            };
            if task.state != TaskState::Ready || task.rt_prio.is_some() {
                continue;
            }
            if task.age() == 0 {
                task.reload_counter();
                self.last_ready_hint = Some(node);
                return Some(node);
            }
        }

        self.last_ready_hint = None;
        None
    }

    // -- Stack validation -------------------------------------------------

    /// Periodic canary validation on the running task's stack. Runs the
    /// actual check every [`STACK_CHECK_INTERVAL`]th call to amortize
    /// the cost over context switches.
    pub fn stack_check(&mut self) {
        self.stack_check_counter += 1;
        if self.stack_check_counter < STACK_CHECK_INTERVAL {
            return;
        }
        self.stack_check_counter = 0;

        let Some(task) = self.current_tcb() else {
            fatal(Error::StackCheck);
        };
        if !task.stack.canaries_intact() {
            log::error!(
                "stack corruption: task {} base={:#x} size={}",
                task.id,
                task.stack.base_addr(),
                task.stack.size()
            );
            fatal(Error::StackCheck);
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
