//! # Kernel Configuration
//!
//! Compile-time constants governing the scheduler, task stacks and the
//! system tick. All limits are fixed at compile time.

/// Machine timer (CLINT mtime) frequency in Hz. On the QEMU `virt`
/// machine the CLINT counts at 10 MHz regardless of core clock.
pub const MTIME_HZ: u32 = 10_000_000;

/// Scheduler tick frequency in Hz. Determines the preemption quantum
/// and the resolution of `delay()` and the software timers.
pub const TICK_HZ: u32 = 1_000;

/// mtime increments per scheduler tick.
pub const TICKS_PER_QUANTUM: u64 = (MTIME_HZ / TICK_HZ) as u64;

/// Safety bound on scheduler iterations per selection pass. If no task
/// is selected within this many ring steps the kernel declares the
/// system unschedulable and halts.
pub const SCHED_IMAX: usize = 500;

/// Minimum task stack size in bytes. Requests below this are rounded up.
pub const MIN_STACK_SIZE: usize = 256;

/// Default stack size used by the idle task and the demo tasks.
pub const DEFAULT_STACK_SIZE: usize = 4096;

/// Required alignment of task stacks, per the RISC-V psABI.
pub const STACK_ALIGN: usize = 16;

/// Sentinel written to the lowest and highest word of every task stack
/// at spawn and verified periodically by the dispatcher.
pub const STACK_CANARY: u32 = 0xA5A5_A5A5;

/// Canary validation cadence: check every Nth dispatch pass. Checking on
/// every switch roughly doubles dispatch cost for large task sets.
pub const STACK_CHECK_INTERVAL: u32 = 32;

/// Upper bound on a counting semaphore's value. Signals beyond this
/// saturate silently.
pub const SEM_MAX_COUNT: i32 = 32_767;

/// Maximum software timers expired per tick. A burst of simultaneous
/// deadlines beyond this spills into the next tick.
pub const TIMER_BATCH_MAX: usize = 8;

/// Slots reserved up front in the timer registry so steady-state
/// start/cancel cycles do not touch the allocator.
pub const TIMER_RESERVE: usize = 16;

/// First id handed out to software timers. Timer ids live in their own
/// namespace, away from task ids.
pub const TIMER_ID_BASE: u16 = 0x6000;

/// Convert a period in milliseconds to scheduler ticks, rounding up so
/// a nonzero period never maps to zero ticks.
pub const fn ms_to_ticks(ms: u32) -> u64 {
    let ticks = (ms as u64 * TICK_HZ as u64).div_ceil(1000);
    if ticks == 0 {
        1
    } else {
        ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ms_to_ticks_rounds_up() {
        // At 1 kHz one tick is one millisecond.
        assert_eq!(ms_to_ticks(1), 1);
        assert_eq!(ms_to_ticks(250), 250);
        // A sub-tick period must still schedule at least one tick out.
        assert_eq!(ms_to_ticks(0), 1);
    }
}
