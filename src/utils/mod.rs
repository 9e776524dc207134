/*
 * Kernel Utilities and Support Functions
 *
 * Common infrastructure used throughout the kernel:
 * - console: byte-level console output/input plus retention buffer
 * - macros: kprint!/kprintln! over the console
 * - logger: log-crate backend routing to the console
 * - timer: monotonic tick counter and sleep helpers
 * - ring_buffer: fixed circular buffer backing the console retention
 */

#[macro_use]
pub mod macros;
pub mod console;
pub mod logger;
pub mod ring_buffer;
pub mod timer;
