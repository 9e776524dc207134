/*
 * CPU Context and Context Switching
 *
 * Defines the TrapFrame saved for every thread and the interrupt-driven
 * context switch mechanism. Both preemptive switches (timer IRQ) and
 * voluntary switches (yield via INT 0x81) go through the same path:
 *
 * 1. CPU pushes the interrupt frame (RIP, CS, RFLAGS, RSP, SS)
 * 2. The naked entry stores DS/ES and all general purpose registers,
 *    completing a TrapFrame on the interrupted stack
 * 3. The Rust dispatch picks the next thread and returns a pointer to
 *    its saved TrapFrame
 * 4. The entry switches RSP to that frame, restores every register and
 *    returns via iretq
 *
 * New threads are started through the same door: a synthetic TrapFrame
 * is installed by iretq as if the thread had been interrupted at its
 * entry point (do_iret). User processes enter Ring 3 this way after
 * exec/fork.
 *
 * STACK LAYOUT AFTER ENTRY (matches TrapFrame, low address first):
 *
 *   rsp + 0    r15 .. rax     (15 registers, pushed rax-first)
 *   rsp + 120  es, ds         (widened to u64)
 *   rsp + 136  rip, cs, rflags, rsp, ss   (pushed by the CPU)
 */

use core::arch::naked_asm;

/// Kernel code segment selector (GDT layout: null, kcode, kdata, ...)
pub const KERNEL_CS: u64 = 0x08;
/// Kernel data segment selector
pub const KERNEL_SS: u64 = 0x10;
/// User data segment selector (RPL=3)
pub const USER_SS: u64 = 0x23;
/// User code segment selector (RPL=3)
pub const USER_CS: u64 = 0x2B;

/// RFLAGS: interrupt enable flag
pub const FLAG_IF: u64 = 0x200;
/// RFLAGS: reserved bit 1, must be set
pub const FLAG_MBS: u64 = 0x2;

/// Hardware timer interrupt vector (PIC IRQ0 after remap).
pub const TIMER_VECTOR: u8 = 0x20;
/// Software interrupt vector used for voluntary yields.
pub const YIELD_VECTOR: u8 = 0x81;

/// Complete saved CPU context for one thread.
///
/// Layout matches what the naked interrupt entries build on the stack,
/// from low to high addresses: general purpose registers, DS/ES (stored
/// widened to u64 for alignment), then the CPU-pushed interrupt frame.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,

    pub es: u64,
    pub ds: u64,

    // Interrupt frame (pushed automatically by the CPU)
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    /// Zeroed frame with kernel segments and interrupts enabled.
    pub fn kernel_default() -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rbp: 0,
            rdi: 0,
            rsi: 0,
            rdx: 0,
            rcx: 0,
            rbx: 0,
            rax: 0,
            es: KERNEL_SS,
            ds: KERNEL_SS,
            rip: 0,
            cs: KERNEL_CS,
            rflags: FLAG_IF | FLAG_MBS,
            rsp: 0,
            ss: KERNEL_SS,
        }
    }

    /// Zeroed frame with Ring 3 segments, for entering userspace.
    pub fn user_default() -> Self {
        Self {
            es: USER_SS,
            ds: USER_SS,
            cs: USER_CS,
            ss: USER_SS,
            ..Self::kernel_default()
        }
    }
}

/// Timer interrupt entry (IRQ0).
///
/// Builds a TrapFrame on the interrupted stack, runs tick processing
/// and (when preemption was requested) picks the next thread; then
/// restores whichever frame the dispatch returned and resumes it via
/// iretq. The EOI is sent from the dispatch, before the switch.
#[unsafe(naked)]
pub unsafe extern "C" fn timer_interrupt_entry() {
    naked_asm!(
        // Reserve the ES/DS slots, then save the register file. First
        // push lands highest, so rax goes first and r15 ends up at rsp.
        "sub rsp, 16",
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        // Segment registers cannot be pushed directly in long mode;
        // rax is already saved, stage through it.
        "mov rax, es",
        "mov [rsp + 120], rax",
        "mov rax, ds",
        "mov [rsp + 128], rax",
        // Dispatch with the frame pointer; RAX returns the frame to
        // resume (possibly the same one).
        "mov rdi, rsp",
        "call {dispatch}",
        "mov rsp, rax",
        // Restore the selected context.
        "mov rax, [rsp + 128]",
        "mov ds, rax",
        "mov rax, [rsp + 120]",
        "mov es, rax",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "add rsp, 16",
        "iretq",
        dispatch = sym crate::sched::timer_interrupt_dispatch,
    )
}

/// Voluntary yield entry (INT 0x81).
///
/// Identical mechanism to the timer entry, but always reschedules and
/// needs no EOI (software interrupts bypass the PIC). INT is not masked
/// by the interrupt flag, so blocked threads can switch away from
/// inside IRQ-disabled critical sections.
#[unsafe(naked)]
pub unsafe extern "C" fn yield_interrupt_entry() {
    naked_asm!(
        "sub rsp, 16",
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rax, es",
        "mov [rsp + 120], rax",
        "mov rax, ds",
        "mov [rsp + 128], rax",
        "mov rdi, rsp",
        "call {dispatch}",
        "mov rsp, rax",
        "mov rax, [rsp + 128]",
        "mov ds, rax",
        "mov rax, [rsp + 120]",
        "mov es, rax",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "add rsp, 16",
        "iretq",
        dispatch = sym crate::sched::yield_interrupt_dispatch,
    )
}

/// Launch a thread from a fully populated TrapFrame. Never returns.
///
/// Restores the whole register file from the frame and iretqs into it.
/// Used for the first activation of forked children and exec'd images.
#[cfg(not(test))]
pub unsafe fn do_iret(frame: &TrapFrame) -> ! {
    unsafe {
        core::arch::asm!(
            "mov rsp, {0}",
            "mov rax, [rsp + 128]",
            "mov ds, rax",
            "mov rax, [rsp + 120]",
            "mov es, rax",
            "pop r15",
            "pop r14",
            "pop r13",
            "pop r12",
            "pop r11",
            "pop r10",
            "pop r9",
            "pop r8",
            "pop rbp",
            "pop rdi",
            "pop rsi",
            "pop rdx",
            "pop rcx",
            "pop rbx",
            "pop rax",
            "add rsp, 16",
            "iretq",
            in(reg) frame as *const TrapFrame,
            options(noreturn),
        )
    }
}

/// Host-harness stand-in: launching a user frame is not possible off
/// the real machine; tests exercise everything up to this point.
#[cfg(test)]
pub unsafe fn do_iret(frame: &TrapFrame) -> ! {
    panic!("do_iret in test harness (rip={:#x})", frame.rip);
}

/// Trigger a context switch from thread context.
#[cfg(not(test))]
pub fn trigger_reschedule() {
    unsafe {
        core::arch::asm!("int 0x81", options(nostack));
    }
}

/// Host-harness stand-in: tests drive the scheduler state machine
/// directly instead of taking the interrupt path.
#[cfg(test)]
pub fn trigger_reschedule() {}
