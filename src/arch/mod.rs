//! # Architecture Port Layer
//!
//! Hardware abstraction boundary for the kernel. Currently implements
//! the RV32 port (QEMU `virt` machine, CLINT timer); extensible to
//! other machines by adding sibling modules.

pub mod rv32;

pub use rv32::{
    context_init, context_restore, context_save, halt, heap_init, idle, init_traps,
    interrupt_disable, interrupt_enable, interrupt_tick, launch_first, read_us, timer_disable,
    timer_enable, Context, TRAP_FRAME_SIZE,
};
