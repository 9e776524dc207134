/*
 * System Timer
 *
 * Monotonic tick counter driven by the timer interrupt (PIT, IRQ0). One
 * tick is one timer period; TIMER_FREQ of them make a second. The tick
 * count is the time base for the sleep service and the MLFQ cadence.
 */

use core::sync::atomic::{AtomicU64, Ordering};

/// Timer interrupts per second.
pub const TIMER_FREQ: u64 = 100;

/// Ticks since boot.
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Advance the tick counter from the timer ISR. Returns the new count.
pub(crate) fn on_tick() -> u64 {
    TICKS.fetch_add(1, Ordering::SeqCst) + 1
}

/// Monotonic ticks since boot.
pub fn timer_ticks() -> u64 {
    TICKS.load(Ordering::SeqCst)
}

/// Ticks elapsed since an earlier reading.
pub fn timer_elapsed(then: u64) -> u64 {
    timer_ticks().saturating_sub(then)
}

/// Sleep for approximately `ticks` timer periods.
pub fn sleep_ticks(ticks: u64) {
    crate::sched::sleep::sleep_until(timer_ticks() + ticks);
}

/// Sleep for approximately `ms` milliseconds (rounded up to the timer
/// resolution).
pub fn sleep_ms(ms: u64) {
    let ticks = ms.div_ceil(1000 / TIMER_FREQ);
    sleep_ticks(ticks);
}
