/*
 * Interrupt Descriptor Table
 *
 * Wires the vectors this kernel actually uses:
 * - 0x20: timer (IRQ0 after PIC remap) -> preemptive context switch
 * - 0x81: voluntary yield              -> same switch path, no EOI
 * - page fault: user faults terminate the process with exit(-1),
 *   kernel faults are fatal
 *
 * The switch entries are naked functions that manage the full register
 * file themselves, so they are installed by address rather than through
 * typed handler signatures.
 */

use lazy_static::lazy_static;
use x86_64::VirtAddr;
use x86_64::structures::idt::InterruptDescriptorTable;

use super::context::{TIMER_VECTOR, YIELD_VECTOR, timer_interrupt_entry, yield_interrupt_entry};

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        unsafe {
            idt[TIMER_VECTOR]
                .set_handler_addr(VirtAddr::new(timer_interrupt_entry as usize as u64));
            idt[YIELD_VECTOR]
                .set_handler_addr(VirtAddr::new(yield_interrupt_entry as usize as u64));
            idt.page_fault
                .set_handler_addr(VirtAddr::new(page_fault_entry as usize as u64));
        }
        idt
    };
}

/// Load the IDT onto the CPU.
pub fn init() {
    IDT.load();
    log::info!("IDT loaded");
}

/// Page fault entry. The CPU pushes an error code on top of the
/// interrupt frame; faults never resume the interrupted context here
/// (user faults exit, kernel faults panic), so the register file is not
/// preserved.
#[unsafe(naked)]
unsafe extern "C" fn page_fault_entry() {
    core::arch::naked_asm!(
        "pop rsi",      // error code
        "mov rdi, cr2", // faulting address
        "call {handler}",
        "ud2",
        handler = sym page_fault_handler,
    )
}

/// Rust side of the page fault path.
///
/// Error code bit 2 distinguishes user-mode faults: those are the user
/// touching memory it does not own, answered with exit(-1). A fault
/// with the bit clear means the kernel itself dereferenced a bad
/// address - unrecoverable.
extern "C" fn page_fault_handler(addr: u64, error_code: u64) -> ! {
    const PF_USER: u64 = 1 << 2;
    if error_code & PF_USER != 0 {
        log::warn!("user page fault at {addr:#x} (err {error_code:#x})");
        crate::userprog::exit(-1);
    }
    panic!("kernel page fault at {addr:#x} (err {error_code:#x})");
}
