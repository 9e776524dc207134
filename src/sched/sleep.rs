/*
 * Timer-Driven Sleep/Wake Service
 *
 * Threads park themselves until an absolute tick. The sleep list is kept
 * sorted by wake tick ascending, so the per-tick wake sweep only looks at
 * the front of the list and stops at the first thread still in the
 * future.
 */

use super::{Sched, SchedMode, mlfqs, with_sched};
use crate::arch::x86_64::{context, intr};

impl Sched {
    /// Park the running thread until `tick`. Returns false (and changes
    /// nothing) if the deadline already passed or the caller is idle.
    pub(crate) fn sleep_insert(&mut self, now: u64, tick: u64) -> bool {
        let cur = self.current;
        if cur == self.idle || now >= tick {
            return false;
        }

        self.thread_mut(cur).wake_tick = tick;
        let pos = self
            .sleepers
            .iter()
            .position(|&t| self.thread(t).wake_tick > tick)
            .unwrap_or(self.sleepers.len());
        self.sleepers.insert(pos, cur);
        self.block_current();
        true
    }

    /// Wake every sleeper whose deadline has arrived. Called from the
    /// timer tick with IRQs off.
    pub(crate) fn wake_expired(&mut self, now: u64) {
        while let Some(&front) = self.sleepers.first() {
            if self.thread(front).wake_tick > now {
                break;
            }
            self.sleepers.remove(0);
            self.thread_mut(front).wake_tick = 0;
            if self.mode() == SchedMode::Mlfq {
                // A long sleep leaves recent_cpu decayed; recompute so
                // the thread re-enters the queue at its current level.
                let t = self.thread(front);
                let p = mlfqs::priority_for(t.recent_cpu, t.nice);
                let t = self.thread_mut(front);
                t.priority = p;
                t.effective_priority = p;
            }
            self.unblock(front);
        }
    }

    #[cfg(test)]
    pub(crate) fn sleeping(&self) -> &[super::Tid] {
        &self.sleepers
    }
}

/// Block the running thread until the given absolute tick.
///
/// A deadline at or before the current tick returns immediately. The
/// wakeup lands within one tick of the deadline: the sweep runs on the
/// first timer interrupt at or after it.
pub fn sleep_until(tick: u64) {
    debug_assert!(!intr::in_isr());
    let old = intr::disable();
    let now = crate::utils::timer::timer_ticks();
    let parked = with_sched(|s| s.sleep_insert(now, tick));
    if parked {
        context::trigger_reschedule();
    }
    intr::set_level(old);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::test_support::*;
    use crate::sched::{SchedMode, ThreadStatus, Tid};

    fn park(s: &mut Sched, tid: Tid, tick: u64) {
        // Drive sleep_insert as if tid were running at tick 0.
        let prev = s.current;
        s.thread_mut(tid).status = ThreadStatus::Running;
        s.ready.retain(|&t| t != tid);
        s.current = tid;
        assert!(s.sleep_insert(0, tick));
        s.current = prev;
    }

    #[test]
    fn test_sleep_list_sorted_and_wake_order() {
        let mut s = fresh(SchedMode::Priority);
        let a = spawn_thread(&mut s, "a", 31);
        let b = spawn_thread(&mut s, "b", 31);
        let c = spawn_thread(&mut s, "c", 31);

        park(&mut s, a, 50);
        park(&mut s, b, 20);
        park(&mut s, c, 35);
        assert_eq!(s.sleeping(), &[b, c, a]);

        // Nothing may wake before its deadline.
        s.wake_expired(19);
        assert_eq!(s.sleeping(), &[b, c, a]);

        s.wake_expired(20);
        assert_eq!(s.sleeping(), &[c, a]);
        assert_eq!(s.thread(b).status, ThreadStatus::Ready);
        assert_eq!(s.thread(b).wake_tick, 0);

        // A late sweep catches everything at once, in deadline order.
        s.wake_expired(60);
        assert!(s.sleeping().is_empty());
        assert_eq!(s.thread(a).status, ThreadStatus::Ready);
        assert_eq!(s.thread(c).status, ThreadStatus::Ready);
    }

    #[test]
    fn test_past_deadline_does_not_park() {
        let mut s = fresh(SchedMode::Priority);
        let cur = s.current;
        assert!(!s.sleep_insert(10, 10));
        assert!(!s.sleep_insert(10, 3));
        assert_eq!(s.thread(cur).status, ThreadStatus::Running);
        assert!(s.sleeping().is_empty());
    }

    #[test]
    fn test_idle_never_sleeps() {
        let mut s = fresh(SchedMode::Priority);
        let idle = s.idle_tid();
        let prev = s.current;
        s.thread_mut(prev).status = ThreadStatus::Ready;
        s.insert_ready(prev);
        s.thread_mut(idle).status = ThreadStatus::Running;
        s.current = idle;
        assert!(!s.sleep_insert(0, 100));
    }
}
