/*
 * Interrupt Gate
 *
 * Central control over the CPU interrupt flag plus the two pieces of
 * per-interrupt bookkeeping the scheduler depends on:
 *
 * 1. LEVEL SAVE/RESTORE: critical sections are expressed as
 *    `let old = intr::disable(); ...; intr::set_level(old);` so nesting
 *    composes without accidentally re-enabling interrupts early.
 * 2. ISR CONTEXT FLAG: code that must not sleep (semaphore down, yield)
 *    asserts `!intr::in_isr()`.
 * 3. YIELD-ON-RETURN: an ISR cannot context-switch in the middle of its
 *    work; it records the request here and the interrupt exit path
 *    performs the switch just before returning to the interrupted thread.
 *
 * The hardware flag operations compile to cli/sti. Under the host test
 * harness all three pieces of state are simulated per-thread, so tests
 * exercising the gate stay independent of each other.
 */

/// Interrupt state, as saved and restored around critical sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrLevel {
    /// Interrupts enabled
    On,
    /// Interrupts disabled
    Off,
}

/// Get the current interrupt level.
pub fn get_level() -> IntrLevel {
    if state::flag_enabled() {
        IntrLevel::On
    } else {
        IntrLevel::Off
    }
}

/// Disable interrupts and return the previous level.
pub fn disable() -> IntrLevel {
    let old = get_level();
    state::flag_disable();
    old
}

/// Enable interrupts.
///
/// Must not be called from an ISR - the interrupted context's flag state
/// is restored by iretq, not by the handler.
pub fn enable() {
    debug_assert!(!in_isr());
    state::flag_enable();
}

/// Restore a previously saved interrupt level.
pub fn set_level(level: IntrLevel) {
    match level {
        IntrLevel::On => state::flag_enable(),
        IntrLevel::Off => state::flag_disable(),
    }
}

/// True while executing an external interrupt handler.
pub fn in_isr() -> bool {
    state::isr_flag()
}

/// Mark entry into an external interrupt handler.
pub(crate) fn enter_isr() {
    state::set_isr_flag(true);
}

/// Mark exit from an external interrupt handler.
pub(crate) fn exit_isr() {
    state::set_isr_flag(false);
}

/// Request that the interrupted thread yields when the ISR returns.
/// Only meaningful in ISR context; the interrupt exit path consumes the
/// request via [`take_yield_request`].
pub fn yield_on_return() {
    state::set_yield_flag(true);
}

/// Consume a pending yield-on-return request.
pub(crate) fn take_yield_request() -> bool {
    let pending = state::yield_flag();
    state::set_yield_flag(false);
    pending
}

#[cfg(not(test))]
mod state {
    use core::sync::atomic::{AtomicBool, Ordering};

    /// Set while the CPU is executing an external interrupt handler.
    static IN_ISR: AtomicBool = AtomicBool::new(false);

    /// Set by an ISR that wants the interrupted thread preempted on
    /// return.
    static YIELD_ON_RETURN: AtomicBool = AtomicBool::new(false);

    pub(super) fn flag_enabled() -> bool {
        x86_64::instructions::interrupts::are_enabled()
    }

    pub(super) fn flag_enable() {
        x86_64::instructions::interrupts::enable();
    }

    pub(super) fn flag_disable() {
        x86_64::instructions::interrupts::disable();
    }

    pub(super) fn isr_flag() -> bool {
        IN_ISR.load(Ordering::SeqCst)
    }

    pub(super) fn set_isr_flag(v: bool) {
        IN_ISR.store(v, Ordering::SeqCst);
    }

    pub(super) fn yield_flag() -> bool {
        YIELD_ON_RETURN.load(Ordering::SeqCst)
    }

    pub(super) fn set_yield_flag(v: bool) {
        YIELD_ON_RETURN.store(v, Ordering::SeqCst);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_nesting() {
        set_level(IntrLevel::On);
        let outer = disable();
        assert_eq!(outer, IntrLevel::On);
        assert_eq!(get_level(), IntrLevel::Off);

        // Nested critical section must not re-enable on exit
        let inner = disable();
        assert_eq!(inner, IntrLevel::Off);
        set_level(inner);
        assert_eq!(get_level(), IntrLevel::Off);

        set_level(outer);
        assert_eq!(get_level(), IntrLevel::On);
    }

    #[test]
    fn test_yield_request_is_consumed_once() {
        enter_isr();
        yield_on_return();
        exit_isr();
        assert!(take_yield_request());
        assert!(!take_yield_request());
    }

    #[test]
    fn test_isr_flag_tracks_entry_and_exit() {
        assert!(!in_isr());
        enter_isr();
        assert!(in_isr());
        exit_isr();
        assert!(!in_isr());
    }
}
