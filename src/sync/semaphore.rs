/*
 * Counting Semaphore
 *
 * A nonnegative counter with two atomic operations:
 * - down ("P"): wait for the value to become positive, then decrement
 * - up ("V"): increment, waking the highest-effective-priority waiter
 *
 * down() may sleep and therefore must not be called from an ISR; up()
 * and try_down() are ISR-safe. Atomicity comes from the IRQ-disabled
 * critical section around the scheduler singleton.
 */

use crate::arch::x86_64::intr;
use crate::sched::thread::Tid;
use crate::sched::{self, Sched, with_sched};

use super::SemId;

// Scheduler-side semaphore operations. These run inside the singleton's
// critical section; the public wrappers below add the interrupt gating
// and the actual context switches.
impl Sched {
    /// Decrement if positive, without blocking.
    pub(crate) fn sema_try_down(&mut self, sem: SemId) -> bool {
        let state = self.sync.sem_mut(sem);
        if state.value > 0 {
            state.value -= 1;
            true
        } else {
            false
        }
    }

    /// Park the running thread on the semaphore's waiter list.
    pub(crate) fn sema_wait_current(&mut self, sem: SemId) {
        let cur = self.current();
        self.sync.sem_mut(sem).waiters.push(cur);
        self.block_current();
    }

    /// Index of the waiter with the highest effective priority; the
    /// first occurrence wins, keeping equal priorities FIFO.
    pub(crate) fn max_effective_waiter(&self, sem: SemId) -> Option<Tid> {
        let mut best: Option<(Tid, i32)> = None;
        for &w in &self.sync.sem(sem).waiters {
            let eff = self.effective(w);
            if best.is_none_or(|(_, b)| eff > b) {
                best = Some((w, eff));
            }
        }
        best.map(|(tid, _)| tid)
    }

    /// Increment the value, waking the best waiter if there is one.
    /// Returns the woken thread.
    pub(crate) fn sema_up_inner(&mut self, sem: SemId) -> Option<Tid> {
        let woken = self.max_effective_waiter(sem);
        if let Some(tid) = woken {
            let state = self.sync.sem_mut(sem);
            let pos = state
                .waiters
                .iter()
                .position(|&t| t == tid)
                .expect("chosen waiter vanished");
            state.waiters.remove(pos);
            self.unblock(tid);
        }
        self.sync.sem_mut(sem).value += 1;
        woken
    }

    /// Waiter count, used by the exit path's fork-handshake check.
    pub(crate) fn sema_has_waiters(&self, sem: SemId) -> bool {
        !self.sync.sem(sem).waiters.is_empty()
    }
}

/// Handle to a counting semaphore.
#[derive(Debug, Clone, Copy)]
pub struct Semaphore {
    id: SemId,
}

impl Semaphore {
    /// Create a semaphore with the given initial value.
    pub fn new(value: usize) -> Self {
        let old = intr::disable();
        let id = with_sched(|s| s.sync.create_sem(value));
        intr::set_level(old);
        Self { id }
    }

    pub(crate) fn from_id(id: SemId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> SemId {
        self.id
    }

    /// Down or "P": wait until the value is positive, then decrement.
    ///
    /// May be called with interrupts disabled; if it sleeps, the next
    /// scheduled thread will turn them back on.
    pub fn down(&self) {
        assert!(!intr::in_isr());
        let old = intr::disable();
        loop {
            let acquired = with_sched(|s| {
                if s.sema_try_down(self.id) {
                    true
                } else {
                    s.sema_wait_current(self.id);
                    false
                }
            });
            if acquired {
                break;
            }
            // Blocked and parked on the waiter list; switch away. On
            // wakeup the value may already be stolen, so re-check.
            crate::arch::x86_64::context::trigger_reschedule();
        }
        intr::set_level(old);
    }

    /// Non-blocking down. Safe from an ISR.
    pub fn try_down(&self) -> bool {
        let old = intr::disable();
        let ok = with_sched(|s| s.sema_try_down(self.id));
        intr::set_level(old);
        ok
    }

    /// Up or "V": increment and wake the highest-priority waiter, then
    /// yield if that waiter outranks us. Safe from an ISR.
    pub fn up(&self) {
        let old = intr::disable();
        with_sched(|s| s.sema_up_inner(self.id));
        sched::yield_if_lower();
        intr::set_level(old);
    }
}
