/*
 * System Call Numbers
 *
 * The kernel's syscall table is a flat numbering, 0 through 13. The
 * caller places the number in RAX and up to three arguments in RDI, RSI
 * and RDX (System V AMD64 convention); the result comes back in RAX.
 */

/// Halt the machine. Never returns.
pub const SYS_HALT: u64 = 0;
/// Terminate the calling process; status goes to the waiting parent.
pub const SYS_EXIT: u64 = 1;
/// Clone the calling process.
pub const SYS_FORK: u64 = 2;
/// Replace the process image.
pub const SYS_EXEC: u64 = 3;
/// Collect a child's exit status.
pub const SYS_WAIT: u64 = 4;
/// Create a file of a given initial size.
pub const SYS_CREATE: u64 = 5;
/// Remove a file by name.
pub const SYS_REMOVE: u64 = 6;
/// Open a file; yields an fd >= 2.
pub const SYS_OPEN: u64 = 7;
/// Size of an open file in bytes.
pub const SYS_FILESIZE: u64 = 8;
/// Read from an fd into a user buffer.
pub const SYS_READ: u64 = 9;
/// Write from a user buffer to an fd.
pub const SYS_WRITE: u64 = 10;
/// Move an fd's cursor to an absolute position.
pub const SYS_SEEK: u64 = 11;
/// Report an fd's cursor position.
pub const SYS_TELL: u64 = 12;
/// Close an fd.
pub const SYS_CLOSE: u64 = 13;
