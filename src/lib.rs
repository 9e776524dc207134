/*
 * Ferrite Kernel Core
 *
 * A small preemptive multi-tasking kernel: priority scheduler with
 * donation (plus an MLFQ mode), semaphores/locks/condition variables
 * built on it, a timer-driven sleep service, and a user-process
 * supervisor (fork/exec/wait/exit, per-process fd tables, SysV argument
 * passing).
 *
 * The crate is the kernel's logic layer. Boot glue (loader protocol,
 * GDT, early console) stays outside; it hands over a heap region, a
 * console sink and the kernel command line, then calls init()/start()
 * and launches the first user program. Under the host test harness the
 * same code runs with std's allocator and simulated interrupt state.
 */

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod fs;
pub mod io;
pub mod memory;
pub mod sched;
pub mod sync;
pub mod syscall;
pub mod userprog;
#[macro_use]
pub mod utils;

pub use sched::{SchedMode, Tid};
pub use sync::{CondVar, Lock, Semaphore};

/// Initialize the kernel core from the boot command line.
///
/// `-o mlfqs` selects the multi-level feedback queue scheduler;
/// otherwise priority scheduling with donation is used. The interrupt
/// plumbing and syscall entry are installed here; preemption starts at
/// start().
pub fn init(cmdline: &str) {
    utils::logger::init();

    let mode = if mlfqs_requested(cmdline) {
        SchedMode::Mlfq
    } else {
        SchedMode::Priority
    };

    #[cfg(not(test))]
    {
        arch::x86_64::init();
        syscall::init();
    }
    sched::init(mode);
}

/// Start preemptive scheduling (spawns the idle thread) and enable
/// interrupts.
pub fn start() {
    sched::start();
    arch::x86_64::intr::enable();
}

/// True if the command line requests the MLFQ scheduler.
fn mlfqs_requested(cmdline: &str) -> bool {
    let mut tokens = cmdline.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "-o" && tokens.next() == Some("mlfqs") {
            return true;
        }
    }
    false
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    // A kernel panic is an assertion failure: report and halt.
    kprintln!("KERNEL PANIC: {}", info);
    loop {
        x86_64::instructions::hlt();
    }
}
