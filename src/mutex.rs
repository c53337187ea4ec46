//! # Mutex and Condition Variable
//!
//! Non-recursive mutex with strict FIFO ownership hand-off, plus a
//! condition variable layered on it. Independent of the semaphore
//! module.
//!
//! `unlock` transfers ownership straight to the oldest waiter — the
//! owner field is set to the wakee before it ever runs — so the lock
//! can never be stolen between release and resume.
//!
//! Timed acquires keep the caller runnable: the task sits in the FIFO
//! queue but spins on yield, polling for the ownership transfer or its
//! deadline. Wake latency is therefore no better than one tick, and on
//! timeout the task dequeues itself so no stale entry survives.

use crate::error::{Error, Result};
use crate::kernel::{self, fatal, kcb_ptr, yield_now};
use crate::sched::{Kcb, WaitQueue};
use crate::sync::{critical, shared, CriticalSection, Shared};
use crate::task::{TaskId, TaskState};

const MUTEX_MAGIC: u32 = 0x4D55_5458;
const COND_MAGIC: u32 = 0x434F_4E44;

// ---------------------------------------------------------------------------
// Mutex
// ---------------------------------------------------------------------------

struct MutexInner {
    /// Owning task id; 0 means unowned.
    owner: TaskId,
    wait_q: WaitQueue,
    magic: u32,
}

/// Outcome of an acquisition attempt.
enum Claim {
    Acquired,
    AlreadyOwner,
    Queued,
}

/// A non-recursive mutex. Re-locking by the owner returns `TaskBusy`.
pub struct Mutex {
    inner: Shared<MutexInner>,
}

impl Mutex {
    pub fn new() -> Mutex {
        Mutex {
            inner: shared(MutexInner {
                owner: 0,
                wait_q: WaitQueue::unbounded(),
                magic: MUTEX_MAGIC,
            }),
        }
    }

    /// Invalidate the mutex. Refused while owned or contended.
    pub fn destroy(&self) -> Result<()> {
        critical(|cs| {
            let mut m = self.inner.borrow_ref_mut(cs);
            if m.magic != MUTEX_MAGIC {
                return Err(Error::Fail);
            }
            if m.owner != 0 || !m.wait_q.is_empty() {
                return Err(Error::TaskBusy);
            }
            m.magic = 0;
            Ok(())
        })
    }

    /// Acquire the mutex, blocking in FIFO order. Returns `TaskBusy` if
    /// the caller already owns it. Operating on a destroyed mutex is a
    /// programming error and fatal.
    pub fn lock(&self) -> Result<()> {
        let claim = critical(|cs| {
            if !self.is_valid(cs) {
                fatal(Error::SemOperation);
            }
            let k = unsafe { &mut *kcb_ptr() };
            self.claim_step(cs, k, true)
        });
        match claim {
            Claim::Acquired => Ok(()),
            Claim::AlreadyOwner => Err(Error::TaskBusy),
            Claim::Queued => {
                yield_now();
                // Resumed: the previous owner made us the owner before
                // waking us.
                Ok(())
            }
        }
    }

    /// Non-blocking acquire.
    pub fn try_lock(&self) -> Result<()> {
        critical(|cs| {
            if !self.is_valid(cs) {
                return Err(Error::Fail);
            }
            let me = unsafe { (*kcb_ptr()).current_id() };
            let mut m = self.inner.borrow_ref_mut(cs);
            if m.owner == me {
                Err(Error::TaskBusy)
            } else if m.owner == 0 {
                m.owner = me;
                Ok(())
            } else {
                Err(Error::TaskBusy)
            }
        })
    }

    /// Acquire with a deadline. A zero timeout degenerates to
    /// [`Mutex::try_lock`]. The caller stays schedulable while queued,
    /// yielding between polls, so expiry is detected within a tick of
    /// the deadline.
    pub fn lock_timeout(&self, ticks: u32) -> Result<()> {
        if ticks == 0 {
            return self.try_lock();
        }

        let me = kernel::current_id();
        let deadline = kernel::ticks() + ticks as u64;

        let claim = critical(|cs| {
            if !self.is_valid(cs) {
                return Err(Error::Fail);
            }
            let k = unsafe { &mut *kcb_ptr() };
            Ok(self.claim_step(cs, k, false))
        })?;

        match claim {
            Claim::Acquired => return Ok(()),
            Claim::AlreadyOwner => return Err(Error::TaskBusy),
            Claim::Queued => {}
        }

        loop {
            if critical(|cs| self.inner.borrow_ref(cs).owner == me) {
                return Ok(());
            }
            if kernel::ticks() >= deadline {
                let removed =
                    critical(|cs| self.inner.borrow_ref_mut(cs).wait_q.remove(me));
                if removed {
                    return Err(Error::Timeout);
                }
                // Dequeued by an unlock at the last moment: the
                // transfer made us the owner.
                return Ok(());
            }
            yield_now();
        }
    }

    /// Release the mutex, handing it to the oldest waiter if any.
    pub fn unlock(&self) -> Result<()> {
        critical(|cs| {
            if !self.is_valid(cs) {
                return Err(Error::Fail);
            }
            let k = unsafe { &mut *kcb_ptr() };
            self.transfer_step(cs, k)
        })
    }

    /// Whether the calling task owns the mutex.
    pub fn owned_by_current(&self) -> bool {
        critical(|cs| {
            if !self.is_valid(cs) {
                return false;
            }
            let me = unsafe { (*kcb_ptr()).current_id() };
            let m = self.inner.borrow_ref(cs);
            m.owner != 0 && m.owner == me
        })
    }

    /// Number of queued waiters.
    pub fn waiting_count(&self) -> Result<usize> {
        critical(|cs| {
            if !self.is_valid(cs) {
                return Err(Error::Fail);
            }
            Ok(self.inner.borrow_ref(cs).wait_q.len())
        })
    }

    fn is_valid(&self, cs: CriticalSection<'_>) -> bool {
        self.inner.borrow_ref(cs).magic == MUTEX_MAGIC
    }

    /// Core acquisition. With `block` the caller is enqueued Blocked
    /// (woken only by an ownership transfer); without it the caller is
    /// enqueued but stays runnable and polls (timed acquire).
    fn claim_step(&self, cs: CriticalSection<'_>, k: &mut Kcb, block: bool) -> Claim {
        let mut m = self.inner.borrow_ref_mut(cs);
        let me = k.current_id();
        if m.owner == me {
            return Claim::AlreadyOwner;
        }
        if m.owner == 0 {
            m.owner = me;
            return Claim::Acquired;
        }
        if block {
            k.block_current(&mut m.wait_q);
        } else if m.wait_q.push(me).is_err() {
            fatal(Error::SemOperation);
        }
        Claim::Queued
    }

    /// Core release: verify ownership, then pass the lock to the oldest
    /// waiter (waking it if it blocked) or mark it free.
    fn transfer_step(&self, cs: CriticalSection<'_>, k: &mut Kcb) -> Result<()> {
        let mut m = self.inner.borrow_ref_mut(cs);
        if m.owner != k.current_id() {
            return Err(Error::NotOwner);
        }
        match m.wait_q.pop() {
            None => {
                m.owner = 0;
            }
            Some(next) => {
                m.owner = next;
                let Some(slot) = k.tasks.find_by_id(next) else {
                    fatal(Error::SemOperation);
                };
                let Some(task) = k.tasks.get_mut(slot) else {
                    fatal(Error::SemOperation);
                };
                match task.state {
                    TaskState::Blocked => task.state = TaskState::Ready,
                    // A timed waiter stays runnable and will observe
                    // the transfer on its next poll.
                    TaskState::Ready | TaskState::Running => {}
                    _ => fatal(Error::SemOperation),
                }
            }
        }
        Ok(())
    }
}

impl Default for Mutex {
    fn default() -> Mutex {
        Mutex::new()
    }
}

// ---------------------------------------------------------------------------
// Condition variable
// ---------------------------------------------------------------------------

struct CondInner {
    wait_q: WaitQueue,
    magic: u32,
}

/// A condition variable. Not tied to a particular mutex; the caller
/// supplies the mutex on each wait.
pub struct Condvar {
    inner: Shared<CondInner>,
}

impl Condvar {
    pub fn new() -> Condvar {
        Condvar {
            inner: shared(CondInner {
                wait_q: WaitQueue::unbounded(),
                magic: COND_MAGIC,
            }),
        }
    }

    /// Invalidate the condition variable. Refused while tasks wait.
    pub fn destroy(&self) -> Result<()> {
        critical(|cs| {
            let mut c = self.inner.borrow_ref_mut(cs);
            if c.magic != COND_MAGIC {
                return Err(Error::Fail);
            }
            if !c.wait_q.is_empty() {
                return Err(Error::TaskBusy);
            }
            c.magic = 0;
            Ok(())
        })
    }

    /// Atomically release `mutex` and wait for a signal, re-acquiring
    /// the mutex before returning. The caller must own the mutex.
    pub fn wait(&self, mutex: &Mutex) -> Result<()> {
        critical(|cs| {
            if !self.is_valid(cs) {
                fatal(Error::SemOperation);
            }
        });
        if !mutex.owned_by_current() {
            return Err(Error::NotOwner);
        }

        critical(|cs| {
            let k = unsafe { &mut *kcb_ptr() };
            self.enqueue_step(cs, k, true);
        });

        if let Err(e) = mutex.unlock() {
            // Roll the enqueue back; we never actually waited.
            critical(|cs| {
                let me = unsafe { (*kcb_ptr()).current_id() };
                let mut c = self.inner.borrow_ref_mut(cs);
                c.wait_q.remove(me);
                let k = unsafe { &mut *kcb_ptr() };
                if let Some(t) = k.current_tcb_mut() {
                    t.state = TaskState::Running;
                }
            });
            return Err(e);
        }

        yield_now();

        // Signaled; the mutex is contended for normally, not handed
        // off by the signaler.
        mutex.lock()
    }

    /// [`Condvar::wait`] with a deadline. A zero timeout fails
    /// immediately. The mutex is re-acquired on both outcomes; wake
    /// latency is no better than one tick.
    pub fn wait_timeout(&self, mutex: &Mutex, ticks: u32) -> Result<()> {
        critical(|cs| {
            if !self.is_valid(cs) {
                fatal(Error::SemOperation);
            }
        });
        if !mutex.owned_by_current() {
            return Err(Error::NotOwner);
        }
        if ticks == 0 {
            return Err(Error::Timeout);
        }

        let me = kernel::current_id();
        let deadline = kernel::ticks() + ticks as u64;

        critical(|cs| {
            let k = unsafe { &mut *kcb_ptr() };
            self.enqueue_step(cs, k, false);
        });

        if let Err(e) = mutex.unlock() {
            critical(|cs| {
                self.inner.borrow_ref_mut(cs).wait_q.remove(me);
            });
            return Err(e);
        }

        let mut timed_out = false;
        loop {
            // A signal removes us from the queue; absence means we
            // were chosen.
            if critical(|cs| !self.inner.borrow_ref(cs).wait_q.contains(me)) {
                break;
            }
            if kernel::ticks() >= deadline {
                critical(|cs| {
                    self.inner.borrow_ref_mut(cs).wait_q.remove(me);
                });
                timed_out = true;
                break;
            }
            yield_now();
        }

        let lock_result = mutex.lock();
        if timed_out {
            Err(Error::Timeout)
        } else {
            lock_result
        }
    }

    /// Wake the oldest waiter, if any.
    pub fn signal(&self) -> Result<()> {
        critical(|cs| {
            if !self.is_valid(cs) {
                return Err(Error::Fail);
            }
            let k = unsafe { &mut *kcb_ptr() };
            self.signal_step(cs, k);
            Ok(())
        })
    }

    /// Wake every waiter; they serialize on the mutex afterwards.
    pub fn broadcast(&self) -> Result<()> {
        critical(|cs| {
            if !self.is_valid(cs) {
                return Err(Error::Fail);
            }
            let k = unsafe { &mut *kcb_ptr() };
            while self.signal_step(cs, k) {}
            Ok(())
        })
    }

    /// Number of tasks waiting.
    pub fn waiting_count(&self) -> Result<usize> {
        critical(|cs| {
            if !self.is_valid(cs) {
                return Err(Error::Fail);
            }
            Ok(self.inner.borrow_ref(cs).wait_q.len())
        })
    }

    fn is_valid(&self, cs: CriticalSection<'_>) -> bool {
        self.inner.borrow_ref(cs).magic == COND_MAGIC
    }

    /// Queue the current task on the condition variable, Blocked for a
    /// plain wait or still runnable for a timed one.
    fn enqueue_step(&self, cs: CriticalSection<'_>, k: &mut Kcb, block: bool) {
        let mut c = self.inner.borrow_ref_mut(cs);
        if block {
            k.block_current(&mut c.wait_q);
        } else {
            let me = k.current_id();
            if c.wait_q.push(me).is_err() {
                fatal(Error::SemOperation);
            }
        }
    }

    /// Pop and wake one waiter. Returns whether one existed.
    fn signal_step(&self, cs: CriticalSection<'_>, k: &mut Kcb) -> bool {
        let mut c = self.inner.borrow_ref_mut(cs);
        let Some(id) = c.wait_q.pop() else {
            return false;
        };
        let Some(slot) = k.tasks.find_by_id(id) else {
            fatal(Error::SemOperation);
        };
        let Some(task) = k.tasks.get_mut(slot) else {
            fatal(Error::SemOperation);
        };
        match task.state {
            TaskState::Blocked => task.state = TaskState::Ready,
            // Timed waiters poll for their dequeue instead.
            TaskState::Ready | TaskState::Running => {}
            _ => fatal(Error::SemOperation),
        }
        true
    }
}

impl Default for Condvar {
    fn default() -> Condvar {
        Condvar::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn spin_entry() -> ! {
        loop {}
    }

    fn kcb_with_tasks(n: usize) -> Kcb {
        let mut k = Kcb::new();
        for _ in 0..n {
            k.spawn(spin_entry, 512);
        }
        k
    }

    /// Drive the scheduler until `id` is the running task.
    fn run_until(k: &mut Kcb, id: TaskId) {
        for _ in 0..64 {
            if k.schedule_next() == id {
                return;
            }
        }
        panic!("task {id} never scheduled");
    }

    #[test]
    fn test_lock_unlock_roundtrip_leaves_unowned() {
        let m = Mutex::new();
        let mut k = kcb_with_tasks(2);
        k.schedule_next();

        let claim = critical(|cs| m.claim_step(cs, &mut k, true));
        assert!(matches!(claim, Claim::Acquired));
        assert_eq!(
            critical(|cs| m.inner.borrow_ref(cs).owner),
            k.current_id()
        );

        critical(|cs| m.transfer_step(cs, &mut k)).unwrap();
        assert_eq!(critical(|cs| m.inner.borrow_ref(cs).owner), 0);
        assert_eq!(m.waiting_count(), Ok(0));
    }

    #[test]
    fn test_relock_by_owner_is_refused() {
        let m = Mutex::new();
        let mut k = kcb_with_tasks(1);
        k.schedule_next();

        assert!(matches!(
            critical(|cs| m.claim_step(cs, &mut k, true)),
            Claim::Acquired
        ));
        assert!(matches!(
            critical(|cs| m.claim_step(cs, &mut k, true)),
            Claim::AlreadyOwner
        ));
    }

    #[test]
    fn test_unlock_by_non_owner_is_refused() {
        let m = Mutex::new();
        let mut k = kcb_with_tasks(2);
        let owner = k.schedule_next();
        assert!(matches!(
            critical(|cs| m.claim_step(cs, &mut k, true)),
            Claim::Acquired
        ));

        let other = if owner == 1 { 2 } else { 1 };
        run_until(&mut k, other);
        assert_eq!(
            critical(|cs| m.transfer_step(cs, &mut k)),
            Err(Error::NotOwner)
        );
    }

    #[test]
    fn test_ownership_transfers_fifo() {
        let m = Mutex::new();
        let mut k = kcb_with_tasks(3);

        let a = k.schedule_next();
        assert!(matches!(
            critical(|cs| m.claim_step(cs, &mut k, true)),
            Claim::Acquired
        ));

        // The two other tasks block on the mutex in scheduling order.
        let b = k.schedule_next();
        assert!(matches!(
            critical(|cs| m.claim_step(cs, &mut k, true)),
            Claim::Queued
        ));
        let c = k.schedule_next();
        assert!(matches!(
            critical(|cs| m.claim_step(cs, &mut k, true)),
            Claim::Queued
        ));
        assert_eq!(m.waiting_count(), Ok(2));

        // A unlocks: B becomes owner before it even runs.
        run_until(&mut k, a);
        critical(|cs| m.transfer_step(cs, &mut k)).unwrap();
        assert_eq!(critical(|cs| m.inner.borrow_ref(cs).owner), b);

        run_until(&mut k, b);
        critical(|cs| m.transfer_step(cs, &mut k)).unwrap();
        assert_eq!(critical(|cs| m.inner.borrow_ref(cs).owner), c);
    }

    #[test]
    fn test_timed_waiter_dequeues_on_timeout_then_fifo_grant() {
        // Task A holds the mutex; B waits with a short deadline and
        // gives up; C waits longer and gets the lock when A releases.
        let m = Mutex::new();
        let mut k = kcb_with_tasks(3);

        let a = k.schedule_next();
        assert!(matches!(
            critical(|cs| m.claim_step(cs, &mut k, true)),
            Claim::Acquired
        ));

        let b = k.schedule_next();
        assert!(matches!(
            critical(|cs| m.claim_step(cs, &mut k, false)),
            Claim::Queued
        ));
        let c = k.schedule_next();
        assert!(matches!(
            critical(|cs| m.claim_step(cs, &mut k, false)),
            Claim::Queued
        ));

        // B's deadline expires: it removes itself and reports Timeout.
        let removed = critical(|cs| m.inner.borrow_ref_mut(cs).wait_q.remove(b));
        assert!(removed);
        assert!(critical(|cs| !m.inner.borrow_ref(cs).wait_q.contains(b)));

        // A releases much later; C is the next owner.
        run_until(&mut k, a);
        critical(|cs| m.transfer_step(cs, &mut k)).unwrap();
        assert_eq!(critical(|cs| m.inner.borrow_ref(cs).owner), c);
        assert_eq!(m.waiting_count(), Ok(0));
    }

    #[test]
    fn test_destroy_rules() {
        let m = Mutex::new();
        let mut k = kcb_with_tasks(2);
        k.schedule_next();

        assert!(matches!(
            critical(|cs| m.claim_step(cs, &mut k, true)),
            Claim::Acquired
        ));
        assert_eq!(m.destroy(), Err(Error::TaskBusy));

        critical(|cs| m.transfer_step(cs, &mut k)).unwrap();
        assert_eq!(m.destroy(), Ok(()));
        assert_eq!(m.try_lock(), Err(Error::Fail));
        assert_eq!(m.waiting_count(), Err(Error::Fail));
    }

    #[test]
    fn test_condvar_signal_wakes_in_fifo_order() {
        let cv = Condvar::new();
        let mut k = kcb_with_tasks(4);

        let mut arrival = std::vec::Vec::new();
        for _ in 0..3 {
            let id = k.schedule_next();
            critical(|cs| cv.enqueue_step(cs, &mut k, true));
            arrival.push(id);
        }
        assert_eq!(cv.waiting_count(), Ok(3));

        for expect in arrival {
            assert!(critical(|cs| cv.signal_step(cs, &mut k)));
            let slot = k.tasks.find_by_id(expect).unwrap();
            assert_eq!(k.tasks.get(slot).unwrap().state, TaskState::Ready);
        }
        assert!(!critical(|cs| cv.signal_step(cs, &mut k)));
    }

    #[test]
    fn test_condvar_broadcast_drains_queue() {
        let cv = Condvar::new();
        let mut k = kcb_with_tasks(4);
        for _ in 0..3 {
            k.schedule_next();
            critical(|cs| cv.enqueue_step(cs, &mut k, true));
        }

        critical(|cs| {
            let kr = &mut k;
            while cv.signal_step(cs, kr) {}
        });
        assert_eq!(cv.waiting_count(), Ok(0));
        for t in k.tasks.iter() {
            assert_ne!(t.state, TaskState::Blocked);
        }
    }

    #[test]
    fn test_condvar_wait_requires_ownership() {
        // No current task owns the mutex here, so the precondition
        // check must fire before any queueing happens.
        let cv = Condvar::new();
        let m = Mutex::new();
        assert_eq!(cv.wait(&m), Err(Error::NotOwner));
        assert_eq!(cv.wait_timeout(&m, 10), Err(Error::NotOwner));
        assert_eq!(cv.waiting_count(), Ok(0));
    }

    #[test]
    fn test_condvar_destroy_refused_with_waiters() {
        let cv = Condvar::new();
        let mut k = kcb_with_tasks(2);
        k.schedule_next();
        critical(|cs| cv.enqueue_step(cs, &mut k, true));

        assert_eq!(cv.destroy(), Err(Error::TaskBusy));
        critical(|cs| cv.signal_step(cs, &mut k));
        assert_eq!(cv.destroy(), Ok(()));
        assert_eq!(cv.signal(), Err(Error::Fail));
    }
}
