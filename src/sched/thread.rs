/*
 * Thread Control Block
 *
 * Defines the Thread structure and its identifier/status types. A thread
 * is either a pure kernel thread or a user process: user threads
 * additionally own an address space, a file descriptor table and the
 * parent/child bookkeeping used by fork/wait/exit.
 *
 * Each thread owns a one-page kernel stack allocated from the page pool.
 * The first word of the stack (its lowest address, the last byte to be
 * reached as the stack grows downward) holds a magic value; a clobbered
 * magic word at a scheduling point means the thread overflowed its stack.
 */

use alloc::vec::Vec;
use core::fmt;

use crate::arch::x86_64::context::TrapFrame;
use crate::io::fd::FdTable;
use crate::memory::addrspace::AddressSpace;
use crate::sched::fixed_point::Fixed;
use crate::sync::{LockId, SemId};

/// Lowest priority (the idle thread runs here).
pub const PRI_MIN: i32 = 0;
/// Default priority for new threads.
pub const PRI_DEFAULT: i32 = 31;
/// Highest priority.
pub const PRI_MAX: i32 = 63;

/// Bounds for the nice value.
pub const NICE_MIN: i32 = -20;
pub const NICE_MAX: i32 = 20;

/// Maximum thread name length in bytes; longer names are truncated.
pub const THREAD_NAME_MAX: usize = 16;

/// Magic value written at the base of every owned kernel stack.
pub const STACK_MAGIC: u64 = 0xcd6a_bf4b_d42d_f210;

/// Thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(pub usize);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// States in a thread's life cycle.
///
/// The status doubles as the queue-membership rule: a Ready thread is on
/// the ready list, a Blocked thread is on at most one wait list or the
/// sleep list, and a Dying thread is owned by the destruction queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Running thread (exactly one at any time).
    Running,
    /// Not running but ready to run.
    Ready,
    /// Waiting for an event to trigger.
    Blocked,
    /// About to be destroyed.
    Dying,
}

/// A kernel thread or user process.
pub struct Thread {
    pub tid: Tid,
    pub name: heapless::String<THREAD_NAME_MAX>,
    pub status: ThreadStatus,

    /// Base priority, as set by the creator or set_priority.
    pub priority: i32,
    /// Base priority adjusted by donation; all scheduling decisions use
    /// this. Invariant: effective_priority >= priority.
    pub effective_priority: i32,

    /// Tick at which a sleeping thread must become ready; 0 = not sleeping.
    pub wake_tick: u64,

    /// MLFQ niceness in [NICE_MIN, NICE_MAX].
    pub nice: i32,
    /// MLFQ recent CPU usage estimate (17.14 fixed point).
    pub recent_cpu: Fixed,

    /// Saved register state, installed by iretq on switch-in.
    pub frame: TrapFrame,

    /// Owned kernel stack page. None only for the adopted boot thread,
    /// which keeps running on the loader-provided stack.
    pub stack: Option<crate::memory::palloc::Page>,

    /// Lock this thread is currently blocked on, if any.
    pub wait_on_lock: Option<LockId>,
    /// Locks currently held; their waiters donate priority to us.
    pub held_locks: Vec<LockId>,

    // -- user process extension --
    /// Weak back-reference to the parent; never followed after the parent
    /// dies without waiting (the child is then orphaned).
    pub parent: Option<Tid>,
    /// Live children, youngest last.
    pub children: Vec<Tid>,
    /// Per-process page table root. None = kernel thread.
    pub addrspace: Option<AddressSpace>,
    /// Open file descriptors (slots 0/1 are the standard streams).
    pub fd_table: FdTable,
    /// Upped on exit; parent downs it in wait.
    pub wait_sema: SemId,
    /// Upped when a forked child finishes (or fails) duplication.
    pub fork_sema: SemId,
    /// Upped by the parent's wait to let the exiting child finalize.
    pub exit_sema: SemId,
    pub exit_status: i32,
}

impl Thread {
    /// Build a TCB in the Blocked state. The caller wires the frame,
    /// registers it with the scheduler and unblocks it.
    pub fn new(
        tid: Tid,
        name: &str,
        priority: i32,
        stack: Option<crate::memory::palloc::Page>,
        wait_sema: SemId,
        fork_sema: SemId,
        exit_sema: SemId,
    ) -> Self {
        debug_assert!((PRI_MIN..=PRI_MAX).contains(&priority));
        Self {
            tid,
            name: bounded_name(name),
            status: ThreadStatus::Blocked,
            priority,
            effective_priority: priority,
            wake_tick: 0,
            nice: 0,
            recent_cpu: Fixed::ZERO,
            frame: TrapFrame::kernel_default(),
            stack,
            wait_on_lock: None,
            held_locks: Vec::new(),
            parent: None,
            children: Vec::new(),
            addrspace: None,
            fd_table: FdTable::new(),
            wait_sema,
            fork_sema,
            exit_sema,
            exit_status: 0,
        }
    }

    /// True if this thread is a user process (owns a page table).
    pub fn is_user(&self) -> bool {
        self.addrspace.is_some()
    }

    /// Verify the stack canary; a clobbered magic word means the kernel
    /// stack overflowed into the guard word.
    pub fn check_stack_canary(&self) {
        if let Some(stack) = &self.stack {
            let bytes = stack.bytes();
            let mut magic = [0u8; 8];
            magic.copy_from_slice(&bytes[..8]);
            assert!(
                u64::from_le_bytes(magic) == STACK_MAGIC,
                "kernel stack overflow in thread {} ({})",
                self.tid,
                self.name
            );
        }
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.tid)
            .field("name", &self.name.as_str())
            .field("status", &self.status)
            .field("priority", &self.priority)
            .field("effective", &self.effective_priority)
            .finish()
    }
}

/// Copy a name into the bounded TCB field, truncating if needed.
pub fn bounded_name(name: &str) -> heapless::String<THREAD_NAME_MAX> {
    let mut s = heapless::String::new();
    for c in name.chars() {
        if s.push(c).is_err() {
            break;
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_name_truncates() {
        assert_eq!(bounded_name("idle").as_str(), "idle");
        assert_eq!(
            bounded_name("a-very-long-thread-name").as_str(),
            "a-very-long-thre"
        );
    }
}
