/*
 * File Abstraction
 *
 * A uniform stream over the three things a file descriptor can name: the
 * console input, the console output, or a real file. Operations that
 * make no sense for a variant return -1 rather than panicking, mirroring
 * the syscall surface they back.
 */

use crate::fs::FileHandle;
use crate::utils::console;

/// What an fd-table slot refers to.
///
/// Stdin and Stdout are singleton console endpoints; there is nothing to
/// close or free behind them.
#[derive(Debug)]
pub enum File {
    Stdin,
    Stdout,
    Stream(FileHandle),
}

impl File {
    /// File size in bytes; -1 for the console endpoints.
    pub fn size(&self) -> i64 {
        match self {
            File::Stream(h) => h.len() as i64,
            _ => -1,
        }
    }

    /// Read into `buf`.
    ///
    /// Console input reads byte-by-byte and stops after a newline or NUL
    /// (line discipline of the original console). Returns bytes read, or
    /// -1 for the output endpoint.
    pub fn read(&mut self, buf: &mut [u8]) -> i64 {
        match self {
            File::Stream(h) => h.read(buf) as i64,
            File::Stdin => {
                let mut n = 0;
                for slot in buf.iter_mut() {
                    let c = console::getc();
                    *slot = c;
                    n += 1;
                    if c == b'\n' || c == 0 {
                        break;
                    }
                }
                n as i64
            }
            File::Stdout => -1,
        }
    }

    /// Write from `buf`. Returns bytes written (0 for a write-denied
    /// stream), or -1 for the input endpoint.
    pub fn write(&mut self, buf: &[u8]) -> i64 {
        match self {
            File::Stream(h) => h.write(buf) as i64,
            File::Stdout => console::putbuf(buf) as i64,
            File::Stdin => -1,
        }
    }

    /// Move the stream cursor; -1 for console endpoints.
    pub fn seek(&mut self, pos: usize) -> i64 {
        match self {
            File::Stream(h) => {
                h.seek(pos);
                0
            }
            _ => -1,
        }
    }

    /// Stream cursor position; -1 for console endpoints.
    pub fn tell(&self) -> i64 {
        match self {
            File::Stream(h) => h.tell() as i64,
            _ => -1,
        }
    }

    /// Deny writes to the backing inode (executable protection).
    pub fn deny_write(&mut self) {
        if let File::Stream(h) = self {
            h.deny_write();
        }
    }

    /// Whether writes to the backing inode are denied. Console output is
    /// never denied; console input cannot be written at all.
    pub fn is_deny_write(&self) -> bool {
        match self {
            File::Stream(h) => h.is_deny_write(),
            File::Stdin => true,
            File::Stdout => false,
        }
    }

    /// Clone this descriptor for fork. Console endpoints stay the
    /// singletons; streams duplicate their handle (cursor and denial
    /// included).
    pub fn duplicate(&self) -> File {
        match self {
            File::Stdin => File::Stdin,
            File::Stdout => File::Stdout,
            File::Stream(h) => File::Stream(h.duplicate()),
        }
    }

    /// True when both descriptors name the same underlying object.
    pub fn same_file(&self, other: &File) -> bool {
        match (self, other) {
            (File::Stdin, File::Stdin) => true,
            (File::Stdout, File::Stdout) => true,
            (File::Stream(a), File::Stream(b)) => a.same_inode(b),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_endpoints_reject_mismatched_ops() {
        assert_eq!(File::Stdin.write(b"x"), -1);
        assert_eq!(File::Stdin.size(), -1);
        assert_eq!(File::Stdout.read(&mut [0u8; 4]), -1);
        assert_eq!(File::Stdout.tell(), -1);
        assert_eq!(File::Stdout.seek(3), -1);
    }

    #[test]
    fn test_stream_roundtrip_and_identity() {
        assert!(crate::fs::install("file-abs", b"hello world"));
        let mut f = File::Stream(crate::fs::open("file-abs").unwrap());
        let mut buf = [0u8; 5];
        assert_eq!(f.read(&mut buf), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(f.tell(), 5);
        assert_eq!(f.size(), 11);

        let d = f.duplicate();
        assert!(f.same_file(&d));
        assert!(!f.same_file(&File::Stdin));
        // Duplicate keeps the cursor
        assert_eq!(d.tell(), 5);
    }

    #[test]
    fn test_stdin_read_stops_at_newline() {
        console::push_input(b"ab\ncd");
        let mut buf = [0u8; 8];
        let n = File::Stdin.read(&mut buf);
        assert_eq!(n, 3);
        assert_eq!(&buf[..3], b"ab\n");
        // Remaining input stays queued for the next read
        let n = File::Stdin.read(&mut buf);
        assert!(n >= 2);
        assert_eq!(&buf[..2], b"cd");
    }
}
