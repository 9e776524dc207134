/*
 * Priority Donation Engine
 *
 * Solves priority inversion: when a high-priority thread blocks on a lock
 * held by a low-priority thread, the holder inherits the waiter's
 * priority so it cannot be starved by the middle priorities, and the
 * inheritance follows the wait_on_lock chain transitively.
 *
 * Contract: effective(T) = max(base(T), effective(W)) over every thread W
 * waiting on a lock held by T.
 *
 * Representation: each thread caches its effective priority; the cache is
 * recomputed from the waiter lists of the thread's held locks on every
 * donation event (acquire-block, release, set_priority). A thread sits in
 * exactly one waiter list, so donating again through the same lock can
 * never double-count - the structural form of donor deduplication.
 *
 * The chain walk is bounded: locks are non-recursive and acquired at
 * finite depth, so a cycle would already be a deadlock. DONATION_DEPTH
 * is a backstop, not a feature.
 */

use super::{Sched, SchedMode, ThreadStatus, Tid};
use crate::sync::LockId;

/// Upper bound on wait_on_lock chain traversal.
pub const DONATION_DEPTH: usize = 8;

impl Sched {
    /// Recompute one thread's cached effective priority from its base
    /// priority and the waiters of every lock it holds.
    ///
    /// Returns true if the cached value changed. Under MLFQ the
    /// scheduler owns priorities and donation never raises them.
    pub(crate) fn refresh_effective(&mut self, tid: Tid) -> bool {
        let mut eff = self.thread(tid).priority;

        if self.mode() == SchedMode::Priority {
            let held = self.thread(tid).held_locks.clone();
            for lock in held {
                let sema = self.sync.lock(lock).sema;
                for &waiter in &self.sync.sem(sema).waiters {
                    let w_eff = self.thread(waiter).effective_priority;
                    if w_eff > eff {
                        eff = w_eff;
                    }
                }
            }
        }

        let t = self.thread_mut(tid);
        let changed = t.effective_priority != eff;
        t.effective_priority = eff;
        if changed && self.thread(tid).status == ThreadStatus::Ready {
            self.resort_ready(tid);
        }
        changed
    }

    /// Propagate a donation along the wait chain starting at a lock
    /// holder: refresh the holder, and if it is itself blocked on a
    /// lock, continue with that lock's holder.
    pub(crate) fn donate_chain(&mut self, holder: Tid) {
        let mut cur = holder;
        for _ in 0..DONATION_DEPTH {
            self.refresh_effective(cur);
            let next = match self.thread(cur).wait_on_lock {
                Some(lock) => self.sync.lock(lock).holder,
                None => None,
            };
            match next {
                Some(h) => cur = h,
                None => break,
            }
        }
    }

    /// Register `who` as a blocked waiter of `lock` and run donation.
    ///
    /// The caller follows up with a reschedule; `who` must be the
    /// running thread.
    pub(crate) fn lock_block_on(&mut self, lock: LockId, who: Tid) {
        debug_assert!(self.thread(who).status == ThreadStatus::Running);
        let sema = self.sync.lock(lock).sema;
        self.thread_mut(who).wait_on_lock = Some(lock);
        self.sync.sem_mut(sema).waiters.push(who);
        self.thread_mut(who).status = ThreadStatus::Blocked;

        if let Some(holder) = self.sync.lock(lock).holder {
            self.donate_chain(holder);
        }
    }

    /// Record `who` as the new holder after its down() succeeded.
    pub(crate) fn lock_grant(&mut self, lock: LockId, who: Tid) {
        debug_assert!(self.sync.lock(lock).holder.is_none());
        self.thread_mut(who).wait_on_lock = None;
        self.sync.lock_mut(lock).holder = Some(who);
        self.thread_mut(who).held_locks.push(lock);
    }

    /// Release `lock`, shedding its donations from `who` and waking the
    /// highest-effective-priority waiter (if any). Returns the woken
    /// thread so the caller can decide whether to yield to it.
    pub(crate) fn lock_release_inner(&mut self, lock: LockId, who: Tid) -> Option<Tid> {
        debug_assert!(self.sync.lock(lock).holder == Some(who));

        self.thread_mut(who).held_locks.retain(|&l| l != lock);
        let sema = self.sync.lock(lock).sema;

        // The waiter about to be woken no longer waits on this lock;
        // clear the link before the wakeup so a concurrent chain walk
        // cannot follow it to the next holder.
        if let Some(winner) = self.max_effective_waiter(sema) {
            self.thread_mut(winner).wait_on_lock = None;
        }

        self.sync.lock_mut(lock).holder = None;
        // Without this lock's waiters the releaser may drop back down.
        self.refresh_effective(who);

        self.sema_up_inner(sema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::PRI_DEFAULT;
    use crate::sched::test_support::*;

    #[test]
    fn test_single_donation_and_release() {
        let mut s = fresh(SchedMode::Priority);
        let low = spawn_thread(&mut s, "low", 10);
        let high = spawn_thread(&mut s, "high", 40);
        let lock = s.sync.create_lock();

        run_as(&mut s, low);
        assert!(s.sema_try_down(s.sync.lock(lock).sema));
        s.lock_grant(lock, low);

        run_as(&mut s, high);
        s.lock_block_on(lock, high);
        assert_eq!(s.effective(low), 40);
        assert_eq!(s.thread(low).priority, 10);

        run_as(&mut s, low);
        let woken = s.lock_release_inner(lock, low);
        assert_eq!(woken, Some(high));
        assert_eq!(s.effective(low), 10);
        assert_eq!(s.thread(high).status, ThreadStatus::Ready);
        assert_eq!(s.thread(high).wait_on_lock, None);
    }

    #[test]
    fn test_donation_chain_through_two_locks() {
        let mut s = fresh(SchedMode::Priority);
        let low = spawn_thread(&mut s, "low", 10);
        let mid = spawn_thread(&mut s, "mid", 20);
        let high = spawn_thread(&mut s, "high", 40);
        let lock_a = s.sync.create_lock();
        let lock_b = s.sync.create_lock();

        // low holds B; mid holds A and blocks on B; high blocks on A.
        run_as(&mut s, low);
        assert!(s.sema_try_down(s.sync.lock(lock_b).sema));
        s.lock_grant(lock_b, low);

        run_as(&mut s, mid);
        assert!(s.sema_try_down(s.sync.lock(lock_a).sema));
        s.lock_grant(lock_a, mid);
        s.lock_block_on(lock_b, mid);
        assert_eq!(s.effective(low), 20);

        run_as(&mut s, high);
        s.lock_block_on(lock_a, high);
        assert_eq!(s.effective(mid), 40);
        assert_eq!(s.effective(low), 40, "donation must ride the chain");
        assert_eq!(s.effective(high), 40);

        // low releases B: the chain collapses back to 10, mid keeps 40.
        run_as(&mut s, low);
        assert_eq!(s.lock_release_inner(lock_b, low), Some(mid));
        assert_eq!(s.effective(low), 10);
        assert_eq!(s.effective(mid), 40);

        // mid releases A: everyone is back at base priority.
        run_as(&mut s, mid);
        assert_eq!(s.lock_release_inner(lock_a, mid), Some(high));
        assert_eq!(s.effective(mid), 20);
        assert_eq!(s.effective(high), 40);
    }

    #[test]
    fn test_release_wakes_highest_waiter_and_resorts() {
        let mut s = fresh(SchedMode::Priority);
        let holder = spawn_thread(&mut s, "holder", 10);
        let w1 = spawn_thread(&mut s, "w1", 25);
        let w2 = spawn_thread(&mut s, "w2", 45);
        let w3 = spawn_thread(&mut s, "w3", 25);
        let lock = s.sync.create_lock();

        run_as(&mut s, holder);
        assert!(s.sema_try_down(s.sync.lock(lock).sema));
        s.lock_grant(lock, holder);
        for w in [w1, w2, w3] {
            run_as(&mut s, w);
            s.lock_block_on(lock, w);
        }
        assert_eq!(s.effective(holder), 45);
        // Holder's ready-queue position reflects the donated priority.
        run_as(&mut s, Tid(1)); // park the holder on the ready queue
        assert_eq!(s.ready_front(), Some(holder));

        run_as(&mut s, holder);
        assert_eq!(s.lock_release_inner(lock, holder), Some(w2));
        assert_eq!(s.effective(holder), 10);
    }

    #[test]
    fn test_set_priority_drops_stale_donation_level() {
        let mut s = fresh(SchedMode::Priority);
        let low = spawn_thread(&mut s, "low", 10);
        let mid = spawn_thread(&mut s, "mid", 20);
        let lock = s.sync.create_lock();

        run_as(&mut s, low);
        assert!(s.sema_try_down(s.sync.lock(lock).sema));
        s.lock_grant(lock, low);
        run_as(&mut s, mid);
        s.lock_block_on(lock, mid);
        assert_eq!(s.effective(low), 20);

        // Raising the base above every donor makes the donations moot...
        s.thread_mut(low).priority = 35;
        s.refresh_effective(low);
        assert_eq!(s.effective(low), 35);

        // ...and lowering it resurfaces the strongest donor.
        s.thread_mut(low).priority = 5;
        s.refresh_effective(low);
        assert_eq!(s.effective(low), 20);
    }

    #[test]
    fn test_effective_never_below_base() {
        let mut s = fresh(SchedMode::Priority);
        let t = spawn_thread(&mut s, "t", PRI_DEFAULT);
        s.refresh_effective(t);
        assert_eq!(s.effective(t), PRI_DEFAULT);
    }

    #[test]
    fn test_mlfq_mode_ignores_donation() {
        let mut s = fresh(SchedMode::Mlfq);
        let low = spawn_thread(&mut s, "low", 10);
        let high = spawn_thread(&mut s, "high", 40);
        let lock = s.sync.create_lock();

        // In MLFQ mode every thread spawns at the recomputed priority;
        // force a spread so inheritance would be observable.
        s.thread_mut(low).priority = 10;
        s.thread_mut(low).effective_priority = 10;
        s.thread_mut(high).priority = 40;
        s.thread_mut(high).effective_priority = 40;

        run_as(&mut s, low);
        assert!(s.sema_try_down(s.sync.lock(lock).sema));
        s.lock_grant(lock, low);
        run_as(&mut s, high);
        s.lock_block_on(lock, high);
        assert_eq!(s.effective(low), 10, "no inheritance under MLFQ");
    }
}
