/*
 * Programmable Interrupt Controller
 *
 * Remaps the chained 8259 PICs away from the CPU exception range and
 * provides the end-of-interrupt acknowledgement the timer handler sends
 * before iretq.
 */

use pic8259::ChainedPics;
use spin::Mutex;

/// Master PIC vector base (IRQ0 -> 0x20, the timer vector).
pub const PIC_1_OFFSET: u8 = 0x20;
/// Slave PIC vector base.
pub const PIC_2_OFFSET: u8 = 0x28;

static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// Remap and initialize both PICs.
pub fn init() {
    unsafe {
        PICS.lock().initialize();
    }
    log::info!("PIC remapped to {:#x}/{:#x}", PIC_1_OFFSET, PIC_2_OFFSET);
}

/// Acknowledge an interrupt so the PIC will deliver the next one.
pub fn end_of_interrupt(vector: u8) {
    unsafe {
        PICS.lock().notify_end_of_interrupt(vector);
    }
}
