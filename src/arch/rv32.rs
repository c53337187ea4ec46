//! # RV32 Port Layer
//!
//! Machine-specific code for a single-hart RV32I machine (QEMU `virt`):
//! the CLINT timer, the trap entry path, and setjmp/longjmp-style
//! context switching over a 19-word buffer.
//!
//! ## Context Switch Mechanism
//!
//! A context switch is, from the C-ABI point of view, just a function
//! call that never returns the normal way. The saved context therefore
//! only needs the callee-saved registers (`s0`–`s11`), `gp`, `tp`, `sp`,
//! `ra`, plus `mcause`/`mepc` for post-mortem debugging and `mstatus`
//! to carry the interrupt-enable state across the switch.
//!
//! `context_save` returns 0 when called directly; `context_restore`
//! rewinds to the matching `context_save`, which then returns nonzero.
//! The scheduler never inspects the buffer contents.
//!
//! ## Interrupt-state preservation
//!
//! Inside a trap, `mstatus.MIE` is 0 and the pre-trap enable bit lives
//! in `mstatus.MPIE`. The save path folds MPIE back into the stored MIE
//! bit so that restoring the context outside a trap reproduces the
//! pre-trap interrupt state. Dropping this detail breaks preemption.
//!
//! All assembly is confined to the RV32 bare-metal target; host builds
//! (unit tests) get inert or panicking fallbacks at the bottom of the
//! file.

use crate::task::Tcb;

// ---------------------------------------------------------------------------
// Saved context
// ---------------------------------------------------------------------------

/// Words in a saved context: s0-s11, gp, tp, sp, ra, mcause, mepc,
/// mstatus.
pub const CONTEXT_WORDS: usize = 19;

const CTX_GP: usize = 12;
const CTX_TP: usize = 13;
const CTX_SP: usize = 14;
const CTX_RA: usize = 15;
const CTX_MSTATUS: usize = 18;

const MSTATUS_MIE: u32 = 1 << 3;
const MSTATUS_MPP_MACH: u32 = 3 << 11;

/// Full trap frame pushed by the interrupt entry path: 30 GPRs plus
/// mcause and mepc, 128 bytes. Every task stack reserves this much as a
/// red-zone at its top so an interrupt at peak stack usage stays inside
/// the allocation.
pub const TRAP_FRAME_SIZE: usize = 128;

/// Opaque saved execution context. The layout is fixed by the assembly
/// in this module; nothing outside the port layer reads the words.
#[repr(C)]
#[derive(Clone)]
pub struct Context {
    regs: [u32; CONTEXT_WORDS],
}

impl Context {
    pub const fn new() -> Context {
        Context {
            regs: [0; CONTEXT_WORDS],
        }
    }

    /// The address execution resumes at when this context is restored.
    #[inline]
    pub(crate) fn resume_addr(&self) -> u32 {
        self.regs[CTX_RA]
    }
}

impl Default for Context {
    fn default() -> Context {
        Context::new()
    }
}

/// Prepare a fresh task's context so that its first restore enters
/// `entry` on its own stack.
///
/// The stack pointer is placed `TRAP_FRAME_SIZE` bytes below the top of
/// the allocation (the red-zone) and rounded down to the 16-byte
/// alignment the psABI requires. `mstatus` starts with interrupts
/// enabled in machine mode.
pub fn context_init(ctx: &mut Context, stack_base: usize, stack_size: usize, entry: usize) {
    if stack_base == 0 || stack_size < TRAP_FRAME_SIZE + 64 || entry == 0 {
        crate::kernel::fatal(crate::error::Error::Fail);
    }

    let mut stack_top = stack_base + stack_size - TRAP_FRAME_SIZE;
    stack_top &= !0xF;
    if stack_top <= stack_base {
        crate::kernel::fatal(crate::error::Error::Fail);
    }

    let (gp, tp) = live_pointers();
    ctx.regs = [0; CONTEXT_WORDS];
    ctx.regs[CTX_SP] = stack_top as u32;
    ctx.regs[CTX_RA] = entry as u32;
    ctx.regs[CTX_MSTATUS] = MSTATUS_MIE | MSTATUS_MPP_MACH;
    // New tasks share the boot thread's global and thread pointers.
    ctx.regs[CTX_GP] = gp;
    ctx.regs[CTX_TP] = tp;
}

#[cfg(all(target_arch = "riscv32", target_os = "none"))]
fn live_pointers() -> (u32, u32) {
    let gp: u32;
    let tp: u32;
    unsafe {
        core::arch::asm!("mv {0}, gp", "mv {1}, tp", out(reg) gp, out(reg) tp);
    }
    (gp, tp)
}

#[cfg(not(all(target_arch = "riscv32", target_os = "none")))]
fn live_pointers() -> (u32, u32) {
    (0, 0)
}

/// Hook run by the scheduler after selecting a task. On the very first
/// entry into a task (resume address still equals the entry point) the
/// global interrupt enable is switched on, so interrupts stay masked
/// until the system is actually running task code.
pub fn interrupt_tick(task: &Tcb) {
    if task.context.resume_addr() == task.entry as usize as u32 {
        enable_interrupts();
    }
}

// ---------------------------------------------------------------------------
// 64-bit reads on a 32-bit bus
// ---------------------------------------------------------------------------

/// Assemble a 64-bit counter from split 32-bit halves with a torn-read
/// guard: read high, read low, re-read high, retry if the high half
/// rolled over in between.
fn read_split_u64(mut hi: impl FnMut() -> u32, mut lo: impl FnMut() -> u32) -> u64 {
    loop {
        let h = hi();
        let l = lo();
        if h == hi() {
            return ((h as u64) << 32) | l as u64;
        }
    }
}

// ---------------------------------------------------------------------------
// RV32 bare-metal implementation
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "riscv32", target_os = "none"))]
mod mach {
    use super::*;
    use crate::config::TICKS_PER_QUANTUM;
    use riscv::register::{mie, mstatus, mtvec};

    // CLINT on the QEMU 'virt' machine.
    const CLINT_BASE: usize = 0x0200_0000;
    const MTIMECMP_LO: *mut u32 = (CLINT_BASE + 0x4000) as *mut u32;
    const MTIMECMP_HI: *mut u32 = (CLINT_BASE + 0x4004) as *mut u32;
    const MTIME_LO: *const u32 = (CLINT_BASE + 0xBFF8) as *const u32;
    const MTIME_HI: *const u32 = (CLINT_BASE + 0xBFFC) as *const u32;

    // QEMU 'virt' test device; writing 0x5555 requests shutdown.
    const TEST_DEVICE: *mut u32 = 0x0010_0000 as *mut u32;
    const TEST_SHUTDOWN: u32 = 0x5555;

    pub(super) fn mtime() -> u64 {
        read_split_u64(
            || unsafe { MTIME_HI.read_volatile() },
            || unsafe { MTIME_LO.read_volatile() },
        )
    }

    fn mtimecmp_read() -> u64 {
        read_split_u64(
            || unsafe { MTIMECMP_HI.read_volatile() },
            || unsafe { MTIMECMP_LO.read_volatile() },
        )
    }

    /// Write the 64-bit compare register without a spurious interrupt:
    /// park the low half at all-ones, set the high half, then the real
    /// low half. The timer interrupt is masked around the sequence.
    fn mtimecmp_write(val: u64) {
        let was_enabled = mie::read().mtimer();
        unsafe {
            mie::clear_mtimer();
            MTIMECMP_LO.write_volatile(u32::MAX);
            MTIMECMP_HI.write_volatile((val >> 32) as u32);
            MTIMECMP_LO.write_volatile(val as u32);
            if was_enabled {
                mie::set_mtimer();
            }
        }
    }

    /// Re-arm the tick relative to the previous compare value, not the
    /// current time, so interrupt latency does not accumulate as drift.
    pub(super) fn timer_rearm() {
        mtimecmp_write(mtimecmp_read() + TICKS_PER_QUANTUM);
    }

    pub(super) fn timer_enable() {
        mtimecmp_write(mtime() + TICKS_PER_QUANTUM);
        unsafe { mie::set_mtimer() };
    }

    pub(super) fn timer_disable() {
        unsafe { mie::clear_mtimer() };
    }

    pub(super) fn enable_interrupts() {
        unsafe { mstatus::set_mie() };
    }

    pub(super) fn idle() {
        riscv::asm::wfi();
    }

    pub(super) fn halt() -> ! {
        riscv::interrupt::disable();
        // Ask QEMU for an orderly shutdown; fall back to parking.
        unsafe { TEST_DEVICE.write_volatile(TEST_SHUTDOWN) };
        loop {
            riscv::asm::wfi();
        }
    }

    /// Install the trap vector (direct mode).
    pub(super) fn init_traps() {
        extern "C" {
            fn _trap_entry();
        }
        unsafe {
            mtvec::write(_trap_entry as usize, mtvec::TrapMode::Direct);
        }
    }

    // -- Trap entry -------------------------------------------------------

    // Full-context trap trampoline: saves 30 GPRs plus mcause/mepc (the
    // 128-byte frame every task stack reserves as its red-zone), hands
    // off to the Rust handler, restores and `mret`s.
    core::arch::global_asm!(
        r#"
        .section .trap, "ax"
        .global _trap_entry
        .align 4
_trap_entry:
        addi    sp, sp, -128

        sw      ra,   0*4(sp)
        sw      gp,   1*4(sp)
        sw      tp,   2*4(sp)
        sw      t0,   3*4(sp)
        sw      t1,   4*4(sp)
        sw      t2,   5*4(sp)
        sw      s0,   6*4(sp)
        sw      s1,   7*4(sp)
        sw      a0,   8*4(sp)
        sw      a1,   9*4(sp)
        sw      a2,  10*4(sp)
        sw      a3,  11*4(sp)
        sw      a4,  12*4(sp)
        sw      a5,  13*4(sp)
        sw      a6,  14*4(sp)
        sw      a7,  15*4(sp)
        sw      s2,  16*4(sp)
        sw      s3,  17*4(sp)
        sw      s4,  18*4(sp)
        sw      s5,  19*4(sp)
        sw      s6,  20*4(sp)
        sw      s7,  21*4(sp)
        sw      s8,  22*4(sp)
        sw      s9,  23*4(sp)
        sw      s10, 24*4(sp)
        sw      s11, 25*4(sp)
        sw      t3,  26*4(sp)
        sw      t4,  27*4(sp)
        sw      t5,  28*4(sp)
        sw      t6,  29*4(sp)

        csrr    a0, mcause
        csrr    a1, mepc
        sw      a0,  30*4(sp)
        sw      a1,  31*4(sp)

        call    _osmium_trap

        lw      a1,  31*4(sp)
        csrw    mepc, a1
        lw      ra,   0*4(sp)
        lw      gp,   1*4(sp)
        lw      tp,   2*4(sp)
        lw      t0,   3*4(sp)
        lw      t1,   4*4(sp)
        lw      t2,   5*4(sp)
        lw      s0,   6*4(sp)
        lw      s1,   7*4(sp)
        lw      a0,   8*4(sp)
        lw      a1,   9*4(sp)
        lw      a2,  10*4(sp)
        lw      a3,  11*4(sp)
        lw      a4,  12*4(sp)
        lw      a5,  13*4(sp)
        lw      a6,  14*4(sp)
        lw      a7,  15*4(sp)
        lw      s2,  16*4(sp)
        lw      s3,  17*4(sp)
        lw      s4,  18*4(sp)
        lw      s5,  19*4(sp)
        lw      s6,  20*4(sp)
        lw      s7,  21*4(sp)
        lw      s8,  22*4(sp)
        lw      s9,  23*4(sp)
        lw      s10, 24*4(sp)
        lw      s11, 25*4(sp)
        lw      t3,  26*4(sp)
        lw      t4,  27*4(sp)
        lw      t5,  28*4(sp)
        lw      t6,  29*4(sp)

        addi    sp, sp, 128
        mret
"#
    );

    const MCAUSE_INTERRUPT: u32 = 1 << 31;
    const IRQ_M_TIMER: u32 = 7;

    /// Rust-level trap handler, called from `_trap_entry`. The machine
    /// timer interrupt drives the scheduler; everything else is fatal.
    #[no_mangle]
    extern "C" fn _osmium_trap(cause: u32, epc: u32) {
        if cause & MCAUSE_INTERRUPT != 0 {
            if cause & !MCAUSE_INTERRUPT == IRQ_M_TIMER {
                timer_rearm();
                crate::kernel::dispatcher();
            } else {
                log::error!("unhandled interrupt: cause={cause:#010x} epc={epc:#010x}");
                halt();
            }
        } else {
            log::error!("exception: cause={cause:#010x} epc={epc:#010x}");
            halt();
        }
    }

    // -- Context save / restore -------------------------------------------

    // _ctx_save: store the callee-saved set plus gp/tp/sp/ra and the
    // CSRs into the buffer in a0, then return 0. The stored mstatus MIE
    // bit is reconstructed from MPIE so that a context saved inside a
    // trap restores the pre-trap interrupt-enable state.
    //
    // _ctx_restore: install mstatus first, reload the registers from the
    // buffer in a0, return a1 (coerced to 1 if zero) by "returning" to
    // the restored ra, i.e. back out of the matching _ctx_save call.
    //
    // _ctx_launch: first entry into a task; reloads the register file
    // from a fresh context (gp/tp are kept from the boot thread) and
    // jumps to the entry point in ra.
    core::arch::global_asm!(
        r#"
        .section .text
        .global _ctx_save
        .align 2
_ctx_save:
        sw      s0,   0*4(a0)
        sw      s1,   1*4(a0)
        sw      s2,   2*4(a0)
        sw      s3,   3*4(a0)
        sw      s4,   4*4(a0)
        sw      s5,   5*4(a0)
        sw      s6,   6*4(a0)
        sw      s7,   7*4(a0)
        sw      s8,   8*4(a0)
        sw      s9,   9*4(a0)
        sw      s10, 10*4(a0)
        sw      s11, 11*4(a0)
        sw      gp,  12*4(a0)
        sw      tp,  13*4(a0)
        sw      sp,  14*4(a0)
        sw      ra,  15*4(a0)
        csrr    t0, mcause
        sw      t0,  16*4(a0)
        csrr    t0, mepc
        sw      t0,  17*4(a0)
        csrr    t0, mstatus
        srli    t1, t0, 4
        andi    t1, t1, 8
        li      t2, -9
        and     t0, t0, t2
        or      t0, t0, t1
        sw      t0,  18*4(a0)
        li      a0, 0
        ret

        .global _ctx_restore
        .align 2
_ctx_restore:
        lw      t0,  18*4(a0)
        csrw    mstatus, t0
        lw      s0,   0*4(a0)
        lw      s1,   1*4(a0)
        lw      s2,   2*4(a0)
        lw      s3,   3*4(a0)
        lw      s4,   4*4(a0)
        lw      s5,   5*4(a0)
        lw      s6,   6*4(a0)
        lw      s7,   7*4(a0)
        lw      s8,   8*4(a0)
        lw      s9,   9*4(a0)
        lw      s10, 10*4(a0)
        lw      s11, 11*4(a0)
        lw      gp,  12*4(a0)
        lw      tp,  13*4(a0)
        lw      sp,  14*4(a0)
        lw      ra,  15*4(a0)
        bnez    a1, 1f
        li      a1, 1
1:
        mv      a0, a1
        ret

        .global _ctx_launch
        .align 2
_ctx_launch:
        lw      s0,   0*4(a0)
        lw      s1,   1*4(a0)
        lw      s2,   2*4(a0)
        lw      s3,   3*4(a0)
        lw      s4,   4*4(a0)
        lw      s5,   5*4(a0)
        lw      s6,   6*4(a0)
        lw      s7,   7*4(a0)
        lw      s8,   8*4(a0)
        lw      s9,   9*4(a0)
        lw      s10, 10*4(a0)
        lw      s11, 11*4(a0)
        lw      sp,  14*4(a0)
        lw      ra,  15*4(a0)
        ret
"#
    );

    extern "C" {
        fn _ctx_save(ctx: *mut Context) -> u32;
        fn _ctx_restore(ctx: *const Context, val: u32) -> !;
        fn _ctx_launch(ctx: *const Context) -> !;
    }

    pub(super) unsafe fn context_save(ctx: &mut Context) -> u32 {
        _ctx_save(ctx as *mut Context)
    }

    pub(super) unsafe fn context_restore(ctx: &Context) -> ! {
        _ctx_restore(ctx as *const Context, 1)
    }

    pub(super) unsafe fn launch_first(ctx: &Context) -> ! {
        enable_interrupts();
        _ctx_launch(ctx as *const Context)
    }

    // -- Heap --------------------------------------------------------------

    #[global_allocator]
    static ALLOCATOR: linked_list_allocator::LockedHeap =
        linked_list_allocator::LockedHeap::empty();

    /// Hand the linker-defined heap region to the allocator. Must run
    /// once, before the first task is spawned.
    pub(super) fn heap_init() {
        extern "C" {
            static mut _sheap: u8;
            static _heap_size: u8;
        }
        unsafe {
            let start = core::ptr::addr_of_mut!(_sheap);
            let size = core::ptr::addr_of!(_heap_size) as usize;
            ALLOCATOR.lock().init(start, size);
        }
    }
}

// ---------------------------------------------------------------------------
// Public surface
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "riscv32", target_os = "none"))]
mod imp {
    use super::*;
    use crate::config::MTIME_HZ;

    /// Microseconds since boot, from the CLINT mtime counter.
    pub fn read_us() -> u64 {
        mach::mtime() / (MTIME_HZ as u64 / 1_000_000)
    }

    pub fn timer_enable() {
        mach::timer_enable();
    }

    pub fn timer_disable() {
        mach::timer_disable();
    }

    pub(super) fn enable_interrupts() {
        mach::enable_interrupts();
    }

    /// Mask machine interrupts. Paired with [`interrupt_enable`] around
    /// the scheduler's context-switch window.
    pub fn interrupt_disable() {
        riscv::interrupt::disable();
    }

    /// Unmask machine interrupts. Safe here: this kernel runs a single
    /// hart and only calls it from task context.
    pub fn interrupt_enable() {
        unsafe { riscv::interrupt::enable() };
    }

    /// Wait for the next interrupt in a low-power state.
    pub fn idle() {
        mach::idle();
    }

    /// Mask interrupts, attempt an orderly shutdown, park forever.
    pub fn halt() -> ! {
        mach::halt()
    }

    pub fn init_traps() {
        mach::init_traps();
    }

    pub fn heap_init() {
        mach::heap_init();
    }

    /// Save the current context. Returns 0 on the direct call and
    /// nonzero when resumed via [`context_restore`].
    ///
    /// # Safety
    /// Must be called with the kernel critical section held; the buffer
    /// must stay alive until the task is next resumed.
    pub unsafe fn context_save(ctx: &mut Context) -> u32 {
        mach::context_save(ctx)
    }

    /// Resume a previously saved context. Does not return.
    ///
    /// # Safety
    /// `ctx` must hold a context saved by [`context_save`] or built by
    /// [`context_init`] over a live stack.
    pub unsafe fn context_restore(ctx: &Context) -> ! {
        mach::context_restore(ctx)
    }

    /// Launch the very first task from the boot thread. Enables global
    /// interrupts on the way in. Does not return.
    ///
    /// # Safety
    /// Single use, from the boot path, with a context built by
    /// [`context_init`].
    pub unsafe fn launch_first(ctx: &Context) -> ! {
        mach::launch_first(ctx)
    }
}

// Host fallbacks: the scheduler logic and all kernel objects are
// exercised on the host by unit tests, which never perform a real
// context switch or touch the CLINT.
#[cfg(not(all(target_arch = "riscv32", target_os = "none")))]
mod imp {
    use super::*;

    pub fn read_us() -> u64 {
        0
    }

    pub fn timer_enable() {}

    pub fn timer_disable() {}

    pub(super) fn enable_interrupts() {}

    pub fn interrupt_disable() {}

    pub fn interrupt_enable() {}

    pub fn idle() {
        core::hint::spin_loop();
    }

    pub fn halt() -> ! {
        panic!("kernel halted");
    }

    pub fn init_traps() {}

    pub fn heap_init() {}

    pub unsafe fn context_save(_ctx: &mut Context) -> u32 {
        unimplemented!("context switching requires the rv32 target")
    }

    pub unsafe fn context_restore(_ctx: &Context) -> ! {
        unimplemented!("context switching requires the rv32 target")
    }

    pub unsafe fn launch_first(_ctx: &Context) -> ! {
        unimplemented!("context switching requires the rv32 target")
    }
}

pub use imp::{
    context_restore, context_save, halt, heap_init, idle, init_traps, interrupt_disable,
    interrupt_enable, launch_first, read_us, timer_disable, timer_enable,
};

use imp::enable_interrupts;

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_init_reserves_red_zone_and_aligns() {
        let mut ctx = Context::new();
        let base = 0x8010_0000usize;
        let size = 1024usize;
        context_init(&mut ctx, base, size, 0x8000_1234);

        let sp = ctx.regs[CTX_SP] as usize;
        assert_eq!(sp % 16, 0);
        assert!(sp <= base + size - TRAP_FRAME_SIZE);
        assert!(sp > base);
        assert_eq!(ctx.regs[CTX_RA], 0x8000_1234);
        assert_eq!(ctx.regs[CTX_MSTATUS], MSTATUS_MIE | MSTATUS_MPP_MACH);
    }

    #[test]
    fn test_context_init_with_unaligned_top() {
        let mut ctx = Context::new();
        // base + size - 128 lands on a non-16-byte boundary.
        context_init(&mut ctx, 0x8010_0008, 1000, 0x8000_0000);
        assert_eq!(ctx.regs[CTX_SP] % 16, 0);
    }

    #[test]
    fn test_split_read_retries_on_rollover() {
        // Simulate the low half rolling over between the two high
        // reads: first pass returns inconsistent halves, second is
        // stable.
        let mut hi_reads = [0u32, 1, 1, 1].into_iter();
        let mut lo_reads = [u32::MAX, 5].into_iter();
        let v = read_split_u64(
            move || hi_reads.next().unwrap(),
            move || lo_reads.next().unwrap(),
        );
        assert_eq!(v, (1u64 << 32) | 5);
    }

    #[test]
    fn test_split_read_fast_path() {
        let v = read_split_u64(|| 2, || 3);
        assert_eq!(v, (2u64 << 32) | 3);
    }
}
