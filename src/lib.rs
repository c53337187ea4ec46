//! # osmium
//!
//! A small preemptive real-time kernel for a single-hart 32-bit RISC-V
//! machine (RV32I, QEMU `virt`).
//!
//! ## Overview
//!
//! Tasks run cooperatively (explicit yield) or preemptively (machine
//! timer tick) under a weighted round-robin scheduler with dynamic
//! priority aging: every task carries a base weight and a counter that
//! the scheduler decrements each pass, selecting the first task whose
//! counter hits zero. Lower weights run proportionally more often;
//! equal weights alternate FIFO.
//!
//! Every synchronization object — counting semaphores, non-recursive
//! mutexes with FIFO hand-off, condition variables, message queues,
//! byte pipes, software timers — is layered over one blocking
//! primitive that atomically queues the current task and yields.
//! Signals hand the contested resource directly to the woken task, so
//! a late arriver can never steal it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   Application Tasks                      │
//! ├─────────────────────────────────────────────────────────┤
//! │                Kernel API (kernel.rs)                    │
//! │   spawn() · delay() · yield_now() · suspend() · start() │
//! ├───────────────┬───────────────────┬─────────────────────┤
//! │  Scheduler    │  Sync objects     │  Software timers    │
//! │  sched.rs     │  semaphore.rs     │  timer.rs           │
//! │  ─ aging RR   │  mutex.rs         │  ─ deadline list    │
//! │  ─ blocking   │  mqueue.rs        │  ─ batch expiry     │
//! │  ─ RT hook    │  pipe.rs          │                     │
//! ├───────────────┴───────────────────┴─────────────────────┤
//! │        Task Model (task.rs · list.rs)                    │
//! │   TCB · packed priority · canaried stacks · task ring   │
//! ├─────────────────────────────────────────────────────────┤
//! │            RV32 Port (arch/rv32.rs)                      │
//! │   CLINT clock · trap entry · setjmp-style contexts      │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Memory Model
//!
//! The kernel consumes `alloc`: task control blocks, stacks and object
//! buffers come from the heap (`linked_list_allocator` on the target).
//! Task stacks are 16-byte aligned, at least 256 bytes, reserve a
//! 128-byte trap-frame red-zone at the top, and carry canaries at both
//! ends that the dispatcher validates periodically.
//!
//! Everything above the port layer is plain Rust and compiles on the
//! host, where the unit tests drive the scheduler and the object state
//! machines directly.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod arch;
pub mod config;
pub mod error;
pub mod kernel;
pub mod list;
pub mod mqueue;
pub mod mutex;
pub mod pipe;
pub mod sched;
pub mod semaphore;
pub mod sync;
pub mod task;
pub mod timer;
