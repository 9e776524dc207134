/*
 * x86_64 Architecture Support Module
 *
 * All x86_64-specific code: the interrupt gate, the saved-context layout
 * and the naked context-switch entries, the IDT wiring for the timer and
 * yield vectors, and the PIC plumbing.
 *
 * Boot glue owns the GDT; the selector constants in `context` document
 * the layout this code assumes (kernel 0x08/0x10, user 0x23/0x2B).
 */

pub mod context;
pub mod idt;
pub mod intr;
pub mod pic;

/// Install the interrupt plumbing: IDT entries for the timer, the yield
/// vector and the fault handlers, then the remapped PIC.
pub fn init() {
    idt::init();
    pic::init();
    log::info!("x86_64 interrupt plumbing ready");
}

/// Power down the machine (QEMU/Bochs exit port); halts forever if the
/// port is not wired.
#[cfg(not(test))]
pub fn power_off() -> ! {
    use x86_64::instructions::port::Port;
    log::info!("powering off");
    unsafe {
        Port::<u16>::new(0x604).write(0x2000u16);
    }
    loop {
        x86_64::instructions::hlt();
    }
}

#[cfg(test)]
pub fn power_off() -> ! {
    panic!("power off");
}
