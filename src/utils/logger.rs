/*
 * Kernel Logger
 *
 * Backend for the log crate. Records are stamped with the timer tick at
 * which they were emitted and the module that emitted them, then pushed
 * through the console:
 *
 *   [   1204] INFO  sched: scheduler started - preemption active
 *
 * Filtering is delegated entirely to the log crate's runtime max level,
 * so verbosity can be raised to Debug from the boot command line without
 * touching this module. Debug records from interrupt context are
 * filtered before they reach the console lock.
 */

use log::{LevelFilter, Metadata, Record};

struct KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        // One knob: whatever set_verbosity() last installed.
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let ticks = crate::utils::timer::timer_ticks();
        // The target defaults to the module path; keep only its leaf so
        // lines stay within a console row.
        let module = record
            .target()
            .rsplit("::")
            .next()
            .unwrap_or("kernel");
        crate::kprintln!("[{ticks:>7}] {:<5} {module}: {}", record.level(), record.args());
    }

    fn flush(&self) {
        // The console sink is unbuffered.
    }
}

static LOGGER: KernelLogger = KernelLogger;

/// Default verbosity: lifecycle events and warnings, no per-operation
/// traces.
const DEFAULT_LEVEL: LevelFilter = LevelFilter::Info;

/// Install the logger. Later calls are no-ops (the log crate accepts
/// exactly one logger for the lifetime of the kernel).
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(DEFAULT_LEVEL);
    }
}

/// Change the runtime verbosity (e.g. from a boot option).
pub fn set_verbosity(level: LevelFilter) {
    log::set_max_level(level);
}
