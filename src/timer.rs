//! # Software Timers
//!
//! Tick-driven one-shot and auto-reload timers. The registry keeps two
//! structures: the timer store itself, ordered by id (ids are handed out
//! monotonically, so plain pushes keep it sorted for lookup), and an
//! active list ordered by absolute deadline so that expiry processing
//! only ever looks at the head.
//!
//! Expiry is batched: at most [`TIMER_BATCH_MAX`] callbacks run per
//! tick, so a burst of simultaneous deadlines cannot starve task code;
//! the remainder fires on the following tick. Callbacks execute in
//! interrupt context and must not block.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::config::{ms_to_ticks, TIMER_BATCH_MAX, TIMER_ID_BASE, TIMER_RESERVE};
use crate::error::{Error, Result};

/// Unique timer identifier, allocated from a namespace disjoint from
/// task ids.
pub type TimerId = u16;

/// Timer expiry callback. Runs in interrupt context.
pub type TimerCallback = Box<dyn FnMut() + Send>;

/// Operating mode of a software timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    /// Created or expired/cancelled; not scheduled.
    Disabled,
    /// Fires once, then disables itself.
    OneShot,
    /// Re-arms itself `period_ms` after each expiry.
    AutoReload,
}

struct Timer {
    id: TimerId,
    callback: TimerCallback,
    period_ms: u32,
    deadline: u64,
    mode: TimerMode,
}

/// The kernel's timer registry, owned by the KCB.
pub struct Timers {
    /// All created timers, sorted by id.
    all: Vec<Timer>,
    /// Armed timers as (deadline, id), sorted by deadline ascending.
    active: VecDeque<(u64, TimerId)>,
    next_offset: u16,
}

fn insert_sorted(active: &mut VecDeque<(u64, TimerId)>, deadline: u64, id: TimerId) {
    let pos = active.partition_point(|&(d, _)| d <= deadline);
    active.insert(pos, (deadline, id));
}

impl Timers {
    pub const fn new() -> Timers {
        Timers {
            all: Vec::new(),
            active: VecDeque::new(),
            next_offset: 0,
        }
    }

    /// Register a new timer in the `Disabled` state.
    pub fn create(&mut self, period_ms: u32, callback: TimerCallback) -> Result<TimerId> {
        if period_ms == 0 {
            return Err(Error::Fail);
        }
        if self.all.is_empty() {
            self.all.reserve(TIMER_RESERVE);
        }

        let id = TIMER_ID_BASE + self.next_offset;
        self.next_offset += 1;
        self.all.push(Timer {
            id,
            callback,
            period_ms,
            deadline: 0,
            mode: TimerMode::Disabled,
        });
        Ok(id)
    }

    /// Remove a timer entirely, disarming it first if needed.
    pub fn destroy(&mut self, id: TimerId) -> Result<()> {
        let idx = self.index_of(id).ok_or(Error::Fail)?;
        if self.all[idx].mode != TimerMode::Disabled {
            self.active.retain(|&(_, t)| t != id);
        }
        self.all.remove(idx);
        Ok(())
    }

    /// Arm a timer. `now` is the current tick count; the first expiry is
    /// `period_ms` (in ticks) from now. Re-arming a running timer resets
    /// its deadline.
    pub fn start(&mut self, id: TimerId, mode: TimerMode, now: u64) -> Result<()> {
        if mode == TimerMode::Disabled {
            return Err(Error::Fail);
        }
        let idx = self.index_of(id).ok_or(Error::Fail)?;
        if self.all[idx].mode != TimerMode::Disabled {
            self.active.retain(|&(_, t)| t != id);
        }

        let deadline = now + ms_to_ticks(self.all[idx].period_ms);
        self.all[idx].mode = mode;
        self.all[idx].deadline = deadline;
        insert_sorted(&mut self.active, deadline, id);
        Ok(())
    }

    /// Disarm a running timer without destroying it.
    pub fn cancel(&mut self, id: TimerId) -> Result<()> {
        let idx = self.index_of(id).ok_or(Error::Fail)?;
        if self.all[idx].mode == TimerMode::Disabled {
            return Err(Error::Fail);
        }
        self.active.retain(|&(_, t)| t != id);
        self.all[idx].mode = TimerMode::Disabled;
        Ok(())
    }

    /// Number of armed timers.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Process expirations for the tick at `now`. Pops at most
    /// [`TIMER_BATCH_MAX`] due timers, runs their callbacks, and
    /// re-arms auto-reload timers relative to `now`.
    pub fn tick(&mut self, now: u64) {
        let mut expired = [0 as TimerId; TIMER_BATCH_MAX];
        let mut count = 0;
        while count < TIMER_BATCH_MAX {
            match self.active.front() {
                Some(&(deadline, id)) if deadline <= now => {
                    self.active.pop_front();
                    expired[count] = id;
                    count += 1;
                }
                // The list is deadline-sorted: the first unexpired
                // entry ends the scan.
                _ => break,
            }
        }

        let Timers { all, active, .. } = self;
        for &id in &expired[..count] {
            let Some(timer) = all.iter_mut().find(|t| t.id == id) else {
                continue;
            };
            (timer.callback)();
            if timer.mode == TimerMode::AutoReload {
                timer.deadline = now + ms_to_ticks(timer.period_ms);
                insert_sorted(active, timer.deadline, id);
            } else {
                timer.mode = TimerMode::Disabled;
            }
        }
    }

    fn index_of(&self, id: TimerId) -> Option<usize> {
        // `all` is id-sorted; binary search keeps lookups cheap even
        // with many timers.
        self.all.binary_search_by_key(&id, |t| t.id).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn counter_cb(hits: &Arc<AtomicU32>) -> TimerCallback {
        let hits = Arc::clone(hits);
        Box::new(move || {
            hits.fetch_add(1, Ordering::Relaxed);
        })
    }

    #[test]
    fn test_create_validates_period() {
        let mut timers = Timers::new();
        assert_eq!(timers.create(0, Box::new(|| {})).unwrap_err(), Error::Fail);
        let id = timers.create(10, Box::new(|| {})).unwrap();
        assert_eq!(id, TIMER_ID_BASE);
        let id2 = timers.create(10, Box::new(|| {})).unwrap();
        assert_eq!(id2, TIMER_ID_BASE + 1);
    }

    #[test]
    fn test_oneshot_fires_once_and_disables() {
        let hits = Arc::new(AtomicU32::new(0));
        let mut timers = Timers::new();
        let id = timers.create(5, counter_cb(&hits)).unwrap();
        timers.start(id, TimerMode::OneShot, 0).unwrap();
        assert_eq!(timers.active_count(), 1);

        // Not due yet at tick 4 (5 ms = 5 ticks at 1 kHz).
        timers.tick(4);
        assert_eq!(hits.load(Ordering::Relaxed), 0);

        timers.tick(5);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert_eq!(timers.active_count(), 0);

        // Stays quiet afterwards.
        timers.tick(100);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_autoreload_rearms_relative_to_now() {
        let hits = Arc::new(AtomicU32::new(0));
        let mut timers = Timers::new();
        let id = timers.create(10, counter_cb(&hits)).unwrap();
        timers.start(id, TimerMode::AutoReload, 0).unwrap();

        for now in 1..=50 {
            timers.tick(now);
        }
        // Deadlines at 10, 20, 30, 40, 50.
        assert_eq!(hits.load(Ordering::Relaxed), 5);
        assert_eq!(timers.active_count(), 1);
    }

    #[test]
    fn test_expiry_order_follows_deadlines() {
        use std::sync::Mutex;
        use std::vec::Vec;

        let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let mut timers = Timers::new();
        for (tag, period) in [(1u32, 30u32), (2, 10), (3, 20)] {
            let order = Arc::clone(&order);
            let id = timers
                .create(period, Box::new(move || order.lock().unwrap().push(tag)))
                .unwrap();
            timers.start(id, TimerMode::OneShot, 0).unwrap();
        }

        for now in 1..=30 {
            timers.tick(now);
        }
        assert_eq!(*order.lock().unwrap(), [2, 3, 1]);
    }

    #[test]
    fn test_batch_cap_defers_overflow_to_next_tick() {
        let hits = Arc::new(AtomicU32::new(0));
        let mut timers = Timers::new();
        for _ in 0..(TIMER_BATCH_MAX + 3) {
            let id = timers.create(1, counter_cb(&hits)).unwrap();
            timers.start(id, TimerMode::OneShot, 0).unwrap();
        }

        timers.tick(1);
        assert_eq!(hits.load(Ordering::Relaxed), TIMER_BATCH_MAX as u32);

        timers.tick(2);
        assert_eq!(hits.load(Ordering::Relaxed), (TIMER_BATCH_MAX + 3) as u32);
    }

    #[test]
    fn test_cancel_and_destroy() {
        let hits = Arc::new(AtomicU32::new(0));
        let mut timers = Timers::new();
        let id = timers.create(5, counter_cb(&hits)).unwrap();

        // Cancelling a disarmed timer is an error.
        assert_eq!(timers.cancel(id).unwrap_err(), Error::Fail);

        timers.start(id, TimerMode::AutoReload, 0).unwrap();
        timers.cancel(id).unwrap();
        timers.tick(50);
        assert_eq!(hits.load(Ordering::Relaxed), 0);

        timers.destroy(id).unwrap();
        assert_eq!(timers.destroy(id).unwrap_err(), Error::Fail);
    }
}
