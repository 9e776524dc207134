/*
 * User-Memory Probe
 *
 * Every pointer a user program hands the kernel is hostile until proven
 * otherwise. The probe validates a range by touching one byte per page
 * through the process's address space; an unmapped page is the captured
 * fault. Checks must happen before any dereference in a syscall handler
 * - a handler that trips a real fault has already lost.
 *
 * Flags:
 * - USER:  the whole range must stay below the user address limit
 * - WRITE: each probed byte is written back, proving the page writable
 * - STR:   the argument is a NUL-terminated string; its length is
 *          discovered by byte-wise probing before the page walk
 */

use bitflags::bitflags;

use crate::memory::addrspace::{AddressSpace, is_user_vaddr, page_round_down};
use crate::memory::palloc::PAGE_SIZE;

bitflags! {
    /// What a pointer check must prove.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CheckFlags: u32 {
        /// Range must lie in user space (kernel-internal checks omit it).
        const USER = 1 << 0;
        /// Pages must be writable.
        const WRITE = 1 << 1;
        /// Size is implicit: a NUL-terminated string.
        const STR = 1 << 2;
    }
}

/// Read a byte of user memory; None if the access would fault.
pub fn read_user_byte(space: &AddressSpace, va: u64) -> Option<u8> {
    space.read_byte(va)
}

/// Write a byte of user memory; false if the access would fault.
pub fn write_user_byte(space: &mut AddressSpace, va: u64, value: u8) -> bool {
    space.write_byte(va, value)
}

/// Validate `[start, start + size)` for the given access, touching one
/// byte per page. With STR, `size` is ignored and computed from the
/// string's probed length (including its terminator).
pub fn check_user(space: &mut AddressSpace, start: u64, size: usize, flags: CheckFlags) -> bool {
    if start == 0 {
        return false;
    }

    let size = if flags.contains(CheckFlags::STR) {
        match probed_strlen(space, start) {
            Some(len) => len + 1,
            None => return false,
        }
    } else {
        size
    };

    let end = match start.checked_add(size as u64) {
        Some(end) => end,
        None => return false,
    };
    if flags.contains(CheckFlags::USER) && !is_user_vaddr(end) {
        return false;
    }

    // Touch one byte per page across the range. A zero-size check still
    // proves the start address itself is accessible.
    let last = if size == 0 { start } else { end - 1 };
    let mut va = start;
    loop {
        let byte = match read_user_byte(space, va) {
            Some(b) => b,
            None => return false,
        };
        if flags.contains(CheckFlags::WRITE) && !write_user_byte(space, va, byte) {
            return false;
        }
        if page_round_down(va) == page_round_down(last) {
            break;
        }
        va = page_round_down(va) + PAGE_SIZE as u64;
    }
    true
}

/// Length of a user string, probing byte by byte; None if any byte of
/// it (terminator included) is inaccessible.
fn probed_strlen(space: &AddressSpace, start: u64) -> Option<usize> {
    let mut len = 0usize;
    loop {
        match read_user_byte(space, start.checked_add(len as u64)?)? {
            0 => return Some(len),
            _ => len += 1,
        }
    }
}
