/*
 * Ring Buffer for Console Retention
 *
 * Fixed-size circular byte buffer keeping the most recent console
 * output. Overwrites the oldest data on overflow; readers get whatever
 * is still retained, in order. Lives behind the console lock, so the
 * implementation itself needs no atomics.
 */

/// Size of the retention buffer (power of 2 for fast modulo).
pub const BUFFER_SIZE: usize = 4096;

pub struct RingBuffer {
    buffer: [u8; BUFFER_SIZE],
    /// Total bytes ever written; the retained window is the last
    /// min(written, BUFFER_SIZE) of them.
    written: usize,
}

impl RingBuffer {
    pub const fn new() -> Self {
        Self {
            buffer: [0; BUFFER_SIZE],
            written: 0,
        }
    }

    /// Append bytes, overwriting the oldest on overflow.
    pub fn write(&mut self, data: &[u8]) {
        for &b in data {
            self.buffer[self.written % BUFFER_SIZE] = b;
            self.written += 1;
        }
    }

    /// Number of bytes currently retained.
    pub fn len(&self) -> usize {
        self.written.min(BUFFER_SIZE)
    }

    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    /// Copy the retained bytes, oldest first. Returns bytes copied.
    pub fn snapshot(&self, out: &mut [u8]) -> usize {
        let len = self.len().min(out.len());
        let start = self.written - self.len();
        for (i, slot) in out[..len].iter_mut().enumerate() {
            *slot = self.buffer[(start + i) % BUFFER_SIZE];
        }
        len
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read() {
        let mut rb = RingBuffer::new();
        rb.write(b"Hello, World!");
        assert_eq!(rb.len(), 13);

        let mut buf = [0u8; 20];
        let n = rb.snapshot(&mut buf);
        assert_eq!(&buf[..n], b"Hello, World!");
    }

    #[test]
    fn test_wrap_around_keeps_newest() {
        let mut rb = RingBuffer::new();
        let filler = [b'x'; BUFFER_SIZE - 2];
        rb.write(&filler);
        rb.write(b"WRAP");

        let mut buf = [0u8; BUFFER_SIZE];
        let n = rb.snapshot(&mut buf);
        assert_eq!(n, BUFFER_SIZE);
        assert_eq!(&buf[n - 4..n], b"WRAP");
        assert_eq!(buf[0], b'x');
    }
}
