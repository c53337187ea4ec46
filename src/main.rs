//! # osmium Demo Firmware
//!
//! A small producer/consumer system exercising the kernel on the QEMU
//! `virt` machine:
//!
//! | Task | Priority | Behavior |
//! |------|----------|----------|
//! | `producer_task` | Normal | Streams a counter record into the pipe every 50 ticks |
//! | `consumer_task` | Normal | Blocks on the pipe, checks records, signals the semaphore |
//! | `monitor_task`  | Low    | Waits on the semaphore, tallies throughput |
//!
//! An auto-reload software timer beats once a second alongside them.
//!
//! Build for `riscv32i-unknown-none-elf` and run under
//! `qemu-system-riscv32 -machine virt -nographic -bios none -kernel …`.

#![cfg_attr(all(target_arch = "riscv32", target_os = "none"), no_std)]
#![cfg_attr(all(target_arch = "riscv32", target_os = "none"), no_main)]

#[cfg(all(target_arch = "riscv32", target_os = "none"))]
mod firmware {
    extern crate alloc;

    use alloc::boxed::Box;
    use panic_halt as _;

    use osmium::config::DEFAULT_STACK_SIZE;
    use osmium::kernel;
    use osmium::pipe::Pipe;
    use osmium::semaphore::Semaphore;
    use osmium::task::Priority;
    use osmium::timer::TimerMode;

    // Shared objects, created in app_main before any task runs.
    static mut PIPE: Option<Pipe> = None;
    static mut DONE_SEM: Option<Semaphore> = None;

    fn pipe() -> &'static Pipe {
        unsafe { (*core::ptr::addr_of!(PIPE)).as_ref().expect("pipe not created") }
    }

    fn done_sem() -> &'static Semaphore {
        unsafe {
            (*core::ptr::addr_of!(DONE_SEM))
                .as_ref()
                .expect("semaphore not created")
        }
    }

    /// Streams 4-byte counter records into the pipe, one every 50
    /// ticks. Blocks whenever the consumer falls behind.
    extern "C" fn producer_task() -> ! {
        let mut seq: u32 = 0;
        loop {
            pipe().write(&seq.to_le_bytes());
            seq = seq.wrapping_add(1);
            kernel::delay(50);
        }
    }

    /// Drains one record at a time and hands a token to the monitor.
    extern "C" fn consumer_task() -> ! {
        let mut expected: u32 = 0;
        loop {
            let mut record = [0u8; 4];
            pipe().read(&mut record);
            let seq = u32::from_le_bytes(record);
            if seq != expected {
                log::warn!("record gap: expected {expected}, got {seq}");
            }
            expected = seq.wrapping_add(1);
            done_sem().signal();
        }
    }

    /// Low-priority bookkeeping: one token per consumed record.
    extern "C" fn monitor_task() -> ! {
        let mut consumed: u64 = 0;
        loop {
            done_sem().wait();
            consumed += 1;
            if consumed % 100 == 0 {
                log::info!("{consumed} records consumed, uptime {} ms", kernel::uptime_ms());
            }
        }
    }

    /// Application entry: create shared objects, spawn the tasks, and
    /// select preemptive scheduling.
    fn app_main() -> bool {
        unsafe {
            PIPE = Some(Pipe::new(64));
            DONE_SEM = Some(Semaphore::new(8, 0).expect("semaphore args"));
        }

        kernel::spawn(producer_task, DEFAULT_STACK_SIZE);
        kernel::spawn(consumer_task, DEFAULT_STACK_SIZE);
        let monitor = kernel::spawn(monitor_task, DEFAULT_STACK_SIZE);
        kernel::set_priority(monitor, Priority::Low).expect("monitor priority");

        let heartbeat = kernel::timer_create(1_000, Box::new(|| log::debug!("heartbeat")))
            .expect("heartbeat timer");
        kernel::timer_start(heartbeat, TimerMode::AutoReload).expect("heartbeat start");

        true
    }

    #[riscv_rt::entry]
    fn main() -> ! {
        osmium::arch::heap_init();
        osmium::arch::init_traps();
        kernel::start(app_main)
    }
}

#[cfg(not(all(target_arch = "riscv32", target_os = "none")))]
fn main() {}
