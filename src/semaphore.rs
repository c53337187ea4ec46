//! # Counting Semaphore
//!
//! Counting semaphore with a strictly FIFO wait queue and direct token
//! hand-off: a signal that finds waiters passes the token straight to
//! the oldest one instead of incrementing the count, so a third task
//! can never steal it between signal and resume. For the same reason
//! `wait` and `try_wait` refuse the count fast path while any task is
//! queued — a late arriver cannot overtake a waiter.

use crate::config::SEM_MAX_COUNT;
use crate::error::{Error, Result};
use crate::kernel::{fatal, kcb_ptr, yield_now};
use crate::sched::{Kcb, WaitQueue};
use crate::sync::{critical, shared, CriticalSection, Shared};

const SEM_MAGIC: u32 = 0x5345_4D41;

struct SemInner {
    count: i32,
    wait_q: WaitQueue,
    magic: u32,
}

/// A counting semaphore. Shareable across tasks (`Sync`); typically
/// stored in a `static` or leaked `Box`.
pub struct Semaphore {
    inner: Shared<SemInner>,
}

impl Semaphore {
    /// Create a semaphore with a bounded wait queue and an initial
    /// token count. Fails on a zero `max_waiters` or a count outside
    /// `0..=SEM_MAX_COUNT`.
    pub fn new(max_waiters: u16, initial: i32) -> Result<Semaphore> {
        if max_waiters == 0 || initial < 0 || initial > SEM_MAX_COUNT {
            return Err(Error::Fail);
        }
        Ok(Semaphore {
            inner: shared(SemInner {
                count: initial,
                wait_q: WaitQueue::with_capacity(max_waiters as usize),
                magic: SEM_MAGIC,
            }),
        })
    }

    /// Invalidate the semaphore. Refused while tasks are waiting.
    pub fn destroy(&self) -> Result<()> {
        critical(|cs| {
            let mut s = self.inner.borrow_ref_mut(cs);
            if s.magic != SEM_MAGIC {
                return Err(Error::Fail);
            }
            if !s.wait_q.is_empty() {
                return Err(Error::TaskBusy);
            }
            s.magic = 0;
            Ok(())
        })
    }

    /// Take a token, blocking in FIFO order until one is handed over.
    /// Calling this on a destroyed semaphore is a programming error and
    /// fatal.
    pub fn wait(&self) {
        let blocked = critical(|cs| {
            let k = unsafe { &mut *kcb_ptr() };
            self.wait_step(cs, k)
        });
        if blocked {
            yield_now();
        }
        // Resumed: the signaler handed the token directly to us; the
        // count was never re-incremented.
    }

    /// Non-blocking take. Fails when no token is available or when
    /// waiters exist (FIFO protection).
    pub fn try_wait(&self) -> Result<()> {
        critical(|cs| {
            let mut s = self.inner.borrow_ref_mut(cs);
            if s.magic != SEM_MAGIC {
                return Err(Error::Fail);
            }
            if s.count > 0 && s.wait_q.is_empty() {
                s.count -= 1;
                Ok(())
            } else {
                Err(Error::Fail)
            }
        })
    }

    /// Release a token. Wakes the oldest waiter if any (handing the
    /// token to it directly), otherwise increments the count, silently
    /// saturating at `SEM_MAX_COUNT`. Yields afterwards when a task was
    /// woken so a higher-priority wakee runs promptly.
    pub fn signal(&self) {
        let woke = critical(|cs| {
            let k = unsafe { &mut *kcb_ptr() };
            self.signal_step(cs, k)
        });
        if woke {
            yield_now();
        }
    }

    /// Current token count. Inherently racy; informational only.
    pub fn value(&self) -> Result<i32> {
        critical(|cs| {
            let s = self.inner.borrow_ref(cs);
            if s.magic != SEM_MAGIC {
                return Err(Error::Fail);
            }
            Ok(s.count)
        })
    }

    /// Number of tasks currently queued on the semaphore.
    pub fn waiting_count(&self) -> Result<usize> {
        critical(|cs| {
            let s = self.inner.borrow_ref(cs);
            if s.magic != SEM_MAGIC {
                return Err(Error::Fail);
            }
            Ok(s.wait_q.len())
        })
    }

    /// Core of `wait`: take the fast path or enqueue the current task.
    /// Returns whether the caller must yield.
    fn wait_step(&self, cs: CriticalSection<'_>, k: &mut Kcb) -> bool {
        let mut s = self.inner.borrow_ref_mut(cs);
        if s.magic != SEM_MAGIC {
            fatal(Error::SemOperation);
        }
        if s.count > 0 && s.wait_q.is_empty() {
            s.count -= 1;
            return false;
        }
        k.block_current(&mut s.wait_q);
        true
    }

    /// Core of `signal`. Returns whether a waiter was woken.
    fn signal_step(&self, cs: CriticalSection<'_>, k: &mut Kcb) -> bool {
        let mut s = self.inner.borrow_ref_mut(cs);
        if s.magic != SEM_MAGIC {
            fatal(Error::SemOperation);
        }
        if !s.wait_q.is_empty() {
            // Token passes directly to the wakee; count stays put.
            k.wake_one(&mut s.wait_q).is_some()
        } else {
            if s.count < SEM_MAX_COUNT {
                s.count += 1;
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskState;

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

    #[test]
    fn test_new_validates_arguments() {
        assert!(Semaphore::new(0, 0).is_err());
        assert!(Semaphore::new(4, -1).is_err());
        assert!(Semaphore::new(4, SEM_MAX_COUNT + 1).is_err());
        assert!(Semaphore::new(4, SEM_MAX_COUNT).is_ok());
    }

    #[test]
    fn test_fast_path_decrements_count() {
        let sem = Semaphore::new(4, 2).unwrap();
        let mut k = kcb_with_tasks(1);
        k.schedule_next();

        let blocked = critical(|cs| sem.wait_step(cs, &mut k));
        assert!(!blocked);
        assert_eq!(sem.value(), Ok(1));

        assert_eq!(sem.try_wait(), Ok(()));
        assert_eq!(sem.value(), Ok(0));
        assert_eq!(sem.try_wait(), Err(Error::Fail));
    }

    #[test]
    fn test_handoff_wakes_fifo_and_skips_count() {
        // Three consumers block in order; three signals must wake them
        // in the same order without the count ever rising.
        let sem = Semaphore::new(4, 0).unwrap();
        let mut k = kcb_with_tasks(4);

        let mut arrival = std::vec::Vec::new();
        for _ in 0..3 {
            let id = k.schedule_next();
            let blocked = critical(|cs| sem.wait_step(cs, &mut k));
            assert!(blocked);
            arrival.push(id);
        }
        assert_eq!(sem.waiting_count(), Ok(3));

        for expect in arrival {
            let woke = critical(|cs| sem.signal_step(cs, &mut k));
            assert!(woke);
            // Token was handed off, not banked.
            assert_eq!(sem.value(), Ok(0));
            let slot = k.tasks.find_by_id(expect).unwrap();
            assert_eq!(k.tasks.get(slot).unwrap().state, TaskState::Ready);
        }
        assert_eq!(sem.waiting_count(), Ok(0));
    }

    #[test]
    fn test_fast_path_refused_while_waiters_exist() {
        let sem = Semaphore::new(4, 0).unwrap();
        let mut k = kcb_with_tasks(2);
        k.schedule_next();
        assert!(critical(|cs| sem.wait_step(cs, &mut k)));

        // Hand the semaphore a token while a waiter is still queued;
        // neither try_wait nor wait may jump the queue.
        critical(|cs| sem.inner.borrow_ref_mut(cs).count = 1);
        assert_eq!(sem.try_wait(), Err(Error::Fail));

        k.schedule_next();
        assert!(critical(|cs| sem.wait_step(cs, &mut k)));
        assert_eq!(sem.waiting_count(), Ok(2));
    }

    #[test]
    fn test_signal_without_waiters_saturates() {
        let sem = Semaphore::new(2, SEM_MAX_COUNT - 1).unwrap();
        let mut k = kcb_with_tasks(1);
        k.schedule_next();

        assert!(!critical(|cs| sem.signal_step(cs, &mut k)));
        assert_eq!(sem.value(), Ok(SEM_MAX_COUNT));
        // Saturation is silent.
        assert!(!critical(|cs| sem.signal_step(cs, &mut k)));
        assert_eq!(sem.value(), Ok(SEM_MAX_COUNT));
    }

    #[test]
    fn test_destroy_refused_with_waiters() {
        let sem = Semaphore::new(4, 0).unwrap();
        let mut k = kcb_with_tasks(2);
        k.schedule_next();
        assert!(critical(|cs| sem.wait_step(cs, &mut k)));

        assert_eq!(sem.destroy(), Err(Error::TaskBusy));

        critical(|cs| {
            let mut s = sem.inner.borrow_ref_mut(cs);
            k.wake_one(&mut s.wait_q);
        });
        assert_eq!(sem.destroy(), Ok(()));
        assert_eq!(sem.try_wait(), Err(Error::Fail));
        assert_eq!(sem.value(), Err(Error::Fail));
    }

    #[test]
    #[should_panic(expected = "kernel halted")]
    fn test_wait_queue_overflow_is_fatal() {
        let sem = Semaphore::new(1, 0).unwrap();
        let mut k = kcb_with_tasks(2);
        k.schedule_next();
        critical(|cs| sem.wait_step(cs, &mut k));
        k.schedule_next();
        critical(|cs| sem.wait_step(cs, &mut k));
    }
}
