/*
 * Lock
 *
 * A lock is a semaphore specialized to initial value 1 plus an owner:
 * only the thread that acquired it may release it, and locks are not
 * recursive. The owner field is what makes priority donation possible -
 * waiters know exactly which thread is standing in their way.
 *
 * Acquire with IRQs off:
 * 1. try-down the semaphore; on success record ourselves as holder
 * 2. otherwise register as a waiter (wait_on_lock + waiter list), donate
 *    our effective priority along the holder chain, and block
 * 3. on wakeup, loop - the value can be stolen by a thread that ran
 *    between the release and our turn on the CPU
 *
 * Release wakes the highest-effective-priority waiter, sheds all of this
 * lock's donations from the releaser and yields if the wakeup outranks
 * us.
 */

use crate::arch::x86_64::{context, intr};
use crate::sched::{self, with_sched};

use super::LockId;

/// Handle to a kernel lock.
#[derive(Debug, Clone, Copy)]
pub struct Lock {
    id: LockId,
}

impl Lock {
    pub fn new() -> Self {
        let old = intr::disable();
        let id = with_sched(|s| s.sync.create_lock());
        intr::set_level(old);
        Self { id }
    }

    pub fn id(&self) -> LockId {
        self.id
    }

    /// Acquire the lock, sleeping until it becomes available.
    ///
    /// Must not be called from an ISR, and the lock must not already be
    /// held by the caller (locks are not recursive).
    pub fn acquire(&self) {
        assert!(!intr::in_isr());
        assert!(!self.held_by_current_thread());

        let old = intr::disable();
        loop {
            let acquired = with_sched(|s| {
                let cur = s.current();
                let sema = s.sync.lock(self.id).sema;
                if s.sema_try_down(sema) {
                    s.lock_grant(self.id, cur);
                    true
                } else {
                    s.lock_block_on(self.id, cur);
                    false
                }
            });
            if acquired {
                break;
            }
            context::trigger_reschedule();
        }
        intr::set_level(old);
    }

    /// Try to acquire without sleeping (and without donation). Safe from
    /// an ISR.
    pub fn try_acquire(&self) -> bool {
        assert!(!self.held_by_current_thread());
        let old = intr::disable();
        let ok = with_sched(|s| {
            let cur = s.current();
            let sema = s.sync.lock(self.id).sema;
            if s.sema_try_down(sema) {
                s.lock_grant(self.id, cur);
                true
            } else {
                false
            }
        });
        intr::set_level(old);
        ok
    }

    /// Release the lock, which the caller must hold.
    pub fn release(&self) {
        assert!(self.held_by_current_thread());
        let old = intr::disable();
        with_sched(|s| {
            let cur = s.current();
            s.lock_release_inner(self.id, cur)
        });
        sched::yield_if_lower();
        intr::set_level(old);
    }

    /// True if the running thread holds this lock. Querying another
    /// thread's ownership would be racy by the time the answer arrived.
    pub fn held_by_current_thread(&self) -> bool {
        let old = intr::disable();
        let held = with_sched(|s| s.sync.lock(self.id).holder == Some(s.current()));
        intr::set_level(old);
        held
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}
