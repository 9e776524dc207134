/*
 * Kernel Console
 *
 * Output side: a byte sink (serial port, framebuffer writer - whatever
 * boot glue registers) plus a retention ring buffer that always keeps
 * the most recent output for diagnostics. putbuf() is the primitive the
 * STDOUT stream and the exit message are built on.
 *
 * Input side: a queue fed by the platform input driver and drained one
 * byte at a time by the STDIN stream.
 */

use alloc::collections::VecDeque;
use core::fmt;
use spin::Mutex;

use super::ring_buffer::RingBuffer;

struct Console {
    sink: Option<fn(&[u8])>,
    retained: RingBuffer,
}

static CONSOLE: Mutex<Console> = Mutex::new(Console {
    sink: None,
    retained: RingBuffer::new(),
});

static INPUT: Mutex<VecDeque<u8>> = Mutex::new(VecDeque::new());

/// Register the platform output sink (serial port, display).
pub fn set_sink(sink: fn(&[u8])) {
    CONSOLE.lock().sink = Some(sink);
}

/// Write raw bytes to the console. Returns the byte count.
pub fn putbuf(bytes: &[u8]) -> usize {
    let mut console = CONSOLE.lock();
    console.retained.write(bytes);
    if let Some(sink) = console.sink {
        sink(bytes);
    }
    bytes.len()
}

/// Copy the most recent console output into `out`, oldest first.
pub fn recent_output(out: &mut [u8]) -> usize {
    CONSOLE.lock().retained.snapshot(out)
}

/// Queue bytes on the console input (called by the input driver).
pub fn push_input(bytes: &[u8]) {
    let mut input = INPUT.lock();
    for &b in bytes {
        input.push_back(b);
    }
}

/// Take one byte of console input; NUL when none is pending.
pub fn getc() -> u8 {
    INPUT.lock().pop_front().unwrap_or(0)
}

/// fmt::Write adapter over putbuf, for the print macros and the logger.
pub struct ConsoleWriter;

impl fmt::Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        putbuf(s.as_bytes());
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    let _ = ConsoleWriter.write_fmt(args);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_putbuf_retains_output() {
        let marker = b"console-retention-probe";
        putbuf(marker);
        let mut buf = [0u8; super::super::ring_buffer::BUFFER_SIZE];
        let n = recent_output(&mut buf);
        let text = &buf[..n];
        assert!(
            text.windows(marker.len()).any(|w| w == marker),
            "retained output must contain what was just written"
        );
    }
}
