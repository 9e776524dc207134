/*
 * System Call Infrastructure
 *
 * Fast system calls via the SYSCALL/SYSRET mechanism. The MSRs are
 * programmed once at boot: EFER.SCE enables the instruction pair, STAR
 * holds the segment bases, LSTAR the entry point and FMASK the RFLAGS
 * bits cleared on entry.
 *
 * Calling convention (System V AMD64):
 * - RAX: syscall number (0..13)
 * - RDI, RSI, RDX: arguments
 * - RAX: return value
 * - RCX/R11 are burned by the hardware (return RIP / RFLAGS)
 *
 * The entry stub reconstructs a full TrapFrame so handlers see the same
 * context shape the interrupt path produces - fork in particular needs
 * the complete user register file to clone.
 */

pub mod handlers;
pub mod numbers;

use core::arch::naked_asm;

use crate::arch::x86_64::context::TrapFrame;
use crate::sched;
use numbers::*;

/// MSR register numbers
const IA32_EFER: u32 = 0xC000_0080;
const IA32_STAR: u32 = 0xC000_0081;
const IA32_LSTAR: u32 = 0xC000_0082;
const IA32_FMASK: u32 = 0xC000_0084;

/// SCE (System Call Extensions) bit in EFER
const EFER_SCE: u64 = 1 << 0;

/// Flags cleared on SYSCALL entry (IF | TF | DF)
const SYSCALL_FMASK: u64 = 0x700;

/// Program the SYSCALL/SYSRET MSRs. Called once after the GDT is up.
pub fn init() {
    unsafe {
        let efer = rdmsr(IA32_EFER);
        wrmsr(IA32_EFER, efer | EFER_SCE);

        // SYSRET loads CS = STAR[63:48]+16 | 3 and SS = STAR[63:48]+8 | 3;
        // base 0x18 yields the user selectors 0x2B / 0x23. SYSCALL loads
        // the kernel pair from STAR[47:32].
        let star = (0x18u64 << 48) | (0x08u64 << 32);
        wrmsr(IA32_STAR, star);

        wrmsr(IA32_LSTAR, syscall_entry as usize as u64);
        wrmsr(IA32_FMASK, SYSCALL_FMASK);
    }
    log::info!("syscall entry installed");
}

/// Read a Model-Specific Register.
///
/// # Safety
/// Must only be called with valid MSR numbers.
#[cfg(not(test))]
unsafe fn rdmsr(msr: u32) -> u64 {
    let low: u32;
    let high: u32;
    unsafe {
        core::arch::asm!(
            "rdmsr",
            in("ecx") msr,
            out("eax") low,
            out("edx") high,
            options(nomem, nostack, preserves_flags)
        );
    }
    ((high as u64) << 32) | (low as u64)
}

/// Write a Model-Specific Register.
///
/// # Safety
/// Must only be called with valid MSR numbers and appropriate values.
#[cfg(not(test))]
unsafe fn wrmsr(msr: u32, value: u64) {
    let low = value as u32;
    let high = (value >> 32) as u32;
    unsafe {
        core::arch::asm!(
            "wrmsr",
            in("ecx") msr,
            in("eax") low,
            in("edx") high,
            options(nomem, nostack, preserves_flags)
        );
    }
}

#[cfg(test)]
unsafe fn rdmsr(_msr: u32) -> u64 {
    0
}

#[cfg(test)]
unsafe fn wrmsr(_msr: u32, _value: u64) {}

/// SYSCALL entry point.
///
/// Builds a TrapFrame below the caller's stack pointer (the CPU does not
/// switch stacks on SYSCALL; interrupts arrive on the interrupt stack,
/// so running the handler here is safe on a single CPU), dispatches, and
/// returns to userspace with the handler's RAX via SYSRET.
///
/// Register state on entry, set by the SYSCALL instruction:
/// - RCX = user RIP (return address)
/// - R11 = user RFLAGS
/// - CS/SS = kernel selectors from STAR
#[unsafe(naked)]
pub unsafe extern "C" fn syscall_entry() {
    naked_asm!(
        // Carve out a TrapFrame and fill the register file
        "sub rsp, 176",
        "mov [rsp + 0], r15",
        "mov [rsp + 8], r14",
        "mov [rsp + 16], r13",
        "mov [rsp + 24], r12",
        "mov [rsp + 32], r11",
        "mov [rsp + 40], r10",
        "mov [rsp + 48], r9",
        "mov [rsp + 56], r8",
        "mov [rsp + 64], rbp",
        "mov [rsp + 72], rdi",
        "mov [rsp + 80], rsi",
        "mov [rsp + 88], rdx",
        "mov [rsp + 96], rcx",
        "mov [rsp + 104], rbx",
        "mov [rsp + 112], rax",
        // Segment slots (rax is saved, reuse it for staging)
        "mov rax, es",
        "mov [rsp + 120], rax",
        "mov rax, ds",
        "mov [rsp + 128], rax",
        // Synthesize the iret-shaped tail: rip/cs/rflags/rsp/ss
        "mov [rsp + 136], rcx",
        "mov qword ptr [rsp + 144], 0x2B",
        "mov [rsp + 152], r11",
        "lea rax, [rsp + 176]",
        "mov [rsp + 160], rax",
        "mov qword ptr [rsp + 168], 0x23",

        "mov rdi, rsp",
        "call {dispatch}",

        // Return value and user context back out of the frame
        "mov rcx, [rsp + 136]",
        "mov r11, [rsp + 152]",
        "mov rax, [rsp + 112]",
        "mov rbx, [rsp + 104]",
        "mov rdx, [rsp + 88]",
        "mov rsi, [rsp + 80]",
        "mov rdi, [rsp + 72]",
        "mov rbp, [rsp + 64]",
        "mov r8, [rsp + 56]",
        "mov r9, [rsp + 48]",
        "mov r10, [rsp + 40]",
        "mov r12, [rsp + 24]",
        "mov r13, [rsp + 16]",
        "mov r14, [rsp + 8]",
        "mov r15, [rsp + 0]",
        "add rsp, 176",
        "sysretq",
        dispatch = sym syscall_dispatch,
    )
}

/// C-ABI shim between the entry stub and the dispatcher.
extern "C" fn syscall_dispatch(frame: *mut TrapFrame) {
    syscall_handler(unsafe { &mut *frame });
}

/// The main system call interface: number in rax, result into rax.
pub fn syscall_handler(frame: &mut TrapFrame) {
    match frame.rax {
        SYS_HALT => crate::arch::x86_64::power_off(),
        SYS_EXIT => handlers::sys_exit(frame.rdi as i32),
        SYS_FORK => {
            // Hand fork a snapshot: the child resumes from exactly this
            // context (with its own rax), the parent's rax becomes the
            // child tid.
            let snapshot = *frame;
            frame.rax = handlers::sys_fork(snapshot.rdi, &snapshot) as u64;
        }
        SYS_EXEC => handlers::sys_exec(frame.rdi),
        SYS_WAIT => frame.rax = handlers::sys_wait(frame.rdi as i64) as u64,
        SYS_CREATE => frame.rax = handlers::sys_create(frame.rdi, frame.rsi) as u64,
        SYS_REMOVE => frame.rax = handlers::sys_remove(frame.rdi) as u64,
        SYS_OPEN => frame.rax = handlers::sys_open(frame.rdi) as u64,
        SYS_FILESIZE => frame.rax = handlers::sys_filesize(frame.rdi as i32) as u64,
        SYS_READ => {
            frame.rax = handlers::sys_read(frame.rdi as i32, frame.rsi, frame.rdx as usize) as u64;
        }
        SYS_WRITE => {
            frame.rax = handlers::sys_write(frame.rdi as i32, frame.rsi, frame.rdx as usize) as u64;
        }
        SYS_SEEK => frame.rax = handlers::sys_seek(frame.rdi as i32, frame.rsi as usize) as u64,
        SYS_TELL => frame.rax = handlers::sys_tell(frame.rdi as i32) as u64,
        SYS_CLOSE => frame.rax = handlers::sys_close(frame.rdi as i32) as u64,
        unknown => {
            crate::kprintln!("undefined system call number: {unknown}");
            sched::thread_exit();
        }
    }
}

#[cfg(test)]
mod tests {
    //! The one test allowed to touch the global scheduler singleton:
    //! everything here runs sequentially inside a single #[test] so no
    //! other thread observes the shared state mid-change.

    use super::*;
    use crate::arch::x86_64::intr;
    use crate::memory::addrspace::AddressSpace;
    use crate::memory::palloc::{self, AllocFlags};
    use crate::sched::thread::PRI_DEFAULT;
    use crate::sched::{SchedMode, ThreadStatus, with_sched};

    const BUF: u64 = 0x40_0000;
    const PATH: u64 = 0x40_1000;

    fn put_user(bytes: &[u8], va: u64) {
        let old = intr::disable();
        with_sched(|s| {
            let cur = s.current();
            let space = s.thread_mut(cur).addrspace.as_mut().unwrap();
            assert!(space.write_bytes(va, bytes));
        });
        intr::set_level(old);
    }

    fn call(num: u64, rdi: u64, rsi: u64, rdx: u64) -> u64 {
        let mut frame = TrapFrame::user_default();
        frame.rax = num;
        frame.rdi = rdi;
        frame.rsi = rsi;
        frame.rdx = rdx;
        syscall_handler(&mut frame);
        frame.rax
    }

    #[test]
    fn test_user_process_syscall_surface() {
        crate::sched::init(SchedMode::Priority);

        // Give the boot thread a user address space: two writable pages
        // for buffers and path strings.
        let old = intr::disable();
        with_sched(|s| {
            let mut space = AddressSpace::new().unwrap();
            for va in [BUF, PATH] {
                let frame = palloc::alloc_page(AllocFlags::USER | AllocFlags::ZERO).unwrap();
                assert!(space.map(va, frame, true));
            }
            let cur = s.current();
            s.thread_mut(cur).addrspace = Some(space);
        });
        intr::set_level(old);

        // create + open
        put_user(b"sys-data.txt\0", PATH);
        assert_eq!(call(SYS_CREATE, PATH, 16, 0), 1);
        assert_eq!(call(SYS_CREATE, PATH, 16, 0), 0, "double create fails");
        let fd = call(SYS_OPEN, PATH, 0, 0);
        assert_eq!(fd, 2, "first free fd above the standard streams");
        assert_eq!(call(SYS_FILESIZE, fd, 0, 0), 16);

        // write from user memory, then read it back via seek
        put_user(b"0123456789", BUF);
        assert_eq!(call(SYS_WRITE, fd, BUF, 10), 10);
        assert_eq!(call(SYS_TELL, fd, 0, 0), 10);
        assert_eq!(call(SYS_SEEK, fd, 2, 0), 0);
        assert_eq!(call(SYS_READ, fd, BUF + 64, 4), 4);
        let old = intr::disable();
        let mut back = [0u8; 4];
        with_sched(|s| {
            let cur = s.current();
            let space = s.thread(cur).addrspace.as_ref().unwrap();
            assert!(space.read_bytes(BUF + 64, &mut back));
        });
        intr::set_level(old);
        assert_eq!(&back, b"2345");

        // close; the fd goes stale
        assert_eq!(call(SYS_CLOSE, fd, 0, 0), fd);
        assert_eq!(call(SYS_CLOSE, fd, 0, 0), -1i64 as u64);
        assert_eq!(call(SYS_READ, fd, BUF, 4), -1i64 as u64);
        assert_eq!(call(SYS_FILESIZE, 77, 0, 0), -1i64 as u64);

        // console write lands in the retained output
        put_user(b"syscall says hi\n", BUF);
        assert_eq!(call(SYS_WRITE, 1, BUF, 16), 16);
        let mut out = [0u8; crate::utils::ring_buffer::BUFFER_SIZE];
        let n = crate::utils::console::recent_output(&mut out);
        assert!(
            out[..n].windows(15).any(|w| w == b"syscall says hi"),
            "stdout syscall must reach the console"
        );

        // remove: gone for future opens
        assert_eq!(call(SYS_REMOVE, PATH, 0, 0), 1);
        assert_eq!(call(SYS_OPEN, PATH, 0, 0), -1i64 as u64);

        // wait: collect a fabricated exited child, then fail the rerun
        let child = {
            let old = intr::disable();
            let child = with_sched(|s| {
                let stack = palloc::alloc_page(AllocFlags::ZERO).unwrap();
                let child = s.create_thread("child", PRI_DEFAULT, stack, drop, 0);
                let cur = s.current();
                s.thread_mut(cur).children.push(child);
                s.thread_mut(child).exit_status = 42;
                // As if the child already ran its exit: wait_sema posted.
                let wait_sema = s.thread(child).wait_sema;
                s.sync.sem_mut(wait_sema).value = 1;
                child
            });
            intr::set_level(old);
            child
        };
        assert_eq!(call(SYS_WAIT, child.0 as u64, 0, 0), 42);
        assert_eq!(
            call(SYS_WAIT, child.0 as u64, 0, 0),
            -1i64 as u64,
            "second wait on the same child fails"
        );
        assert_eq!(call(SYS_WAIT, 9999, 0, 0), -1i64 as u64);

        // Bad pointer: the process is terminated with status -1. Wire a
        // parent in first so the whole exit handshake runs (message,
        // wait_sema post, exit_sema hold - pre-posted here so the dying
        // thread does not block under the harness). The harness then
        // surfaces the never-returning exit as a panic at the end of
        // thread_exit.
        let old = intr::disable();
        with_sched(|s| {
            let stack = palloc::alloc_page(AllocFlags::ZERO).unwrap();
            let parent = s.create_thread("parent-sim", PRI_DEFAULT, stack, drop, 0);
            let cur = s.current();
            s.thread_mut(cur).parent = Some(parent);
            s.thread_mut(parent).children.push(cur);
            let exit_sema = s.thread(cur).exit_sema;
            s.sync.sem_mut(exit_sema).value = 1;
        });
        intr::set_level(old);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            call(SYS_READ, 0, 0x7000_0000, 8)
        }));
        assert!(result.is_err());
        let old = intr::disable();
        with_sched(|s| {
            let cur = s.current();
            assert_eq!(s.thread(cur).exit_status, -1);
            // Undo the exit bookkeeping so the harness thread stays sane.
            s.thread_mut(cur).status = ThreadStatus::Running;
        });
        intr::set_level(old);

        // The exit path printed the canonical message for a user thread.
        let n = crate::utils::console::recent_output(&mut out);
        assert!(
            out[..n].windows(14).any(|w| w == b"main: exit(-1)"),
            "exit message must be printed for user processes"
        );
    }
}
