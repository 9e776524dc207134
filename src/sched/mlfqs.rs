/*
 * Multi-Level Feedback Queue Maintenance
 *
 * In MLFQ mode the scheduler computes every priority itself from two
 * inputs the threads cannot fake: how much CPU they recently used
 * (recent_cpu, decayed exponentially) and how generous they declared
 * themselves (nice).
 *
 * Cadence, driven from the timer tick:
 * - every tick:       recent_cpu of the running thread += 1
 * - every 4th tick:   priority of every thread recomputed, queue resorted
 * - every second:     load_avg updated, recent_cpu of every thread decayed
 *
 * Formulas (17.14 fixed point):
 *   priority   = PRI_MAX - recent_cpu/4 - 2*nice   (clamped to range)
 *   load_avg   = (59/60)*load_avg + (1/60)*ready_threads
 *   recent_cpu = (2*load_avg)/(2*load_avg + 1) * recent_cpu + nice
 */

use super::fixed_point::Fixed;
use super::{PRI_MAX, PRI_MIN, Sched};
use crate::arch::x86_64::intr;
use crate::utils::timer::TIMER_FREQ;

/// Ticks between whole-system priority recomputations.
pub const PRIORITY_RECALC_PERIOD: u64 = 4;

/// MLFQ priority for a given recent_cpu/nice pair.
pub fn priority_for(recent_cpu: Fixed, nice: i32) -> i32 {
    let p = (Fixed::from_int(PRI_MAX) - recent_cpu.div_int(4) - Fixed::from_int(nice * 2)).round();
    p.clamp(PRI_MIN, PRI_MAX)
}

/// Per-tick MLFQ maintenance; `now` is the monotonic tick count.
pub(crate) fn on_tick(s: &mut Sched, now: u64) {
    let cur = s.current();
    if cur != s.idle_tid() {
        let t = s.thread_mut(cur);
        t.recent_cpu = t.recent_cpu.add_int(1);
    }

    if now % TIMER_FREQ == 0 {
        update_load_avg(s);
        decay_recent_cpu(s);
    }

    if now % PRIORITY_RECALC_PERIOD == 0 {
        update_priorities(s);
        intr::yield_on_return();
    }
}

/// load_avg = (59*load_avg + ready_threads)/60, where ready_threads
/// counts ready plus running threads, excluding idle.
fn update_load_avg(s: &mut Sched) {
    let ready = s.ready_thread_count() as i32;
    s.load_avg = (s.load_avg.mul_int(59) + Fixed::from_int(ready)).div_int(60);
}

/// recent_cpu = decay*recent_cpu + nice for every thread, with
/// decay = 2*load_avg / (2*load_avg + 1).
fn decay_recent_cpu(s: &mut Sched) {
    let twice_load = s.load_avg.mul_int(2);
    let decay = twice_load.div(twice_load.add_int(1));
    let idle = s.idle_tid();
    for tid in s.all_tids() {
        if tid == idle {
            continue;
        }
        let t = s.thread_mut(tid);
        t.recent_cpu = t.recent_cpu.mul(decay).add_int(t.nice);
    }
}

/// Recompute every thread's priority and restore ready-queue order.
fn update_priorities(s: &mut Sched) {
    let idle = s.idle_tid();
    for tid in s.all_tids() {
        if tid == idle {
            continue;
        }
        let t = s.thread(tid);
        let p = priority_for(t.recent_cpu, t.nice);
        let t = s.thread_mut(tid);
        t.priority = p;
        t.effective_priority = p;
    }
    s.sort_ready();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::test_support::*;
    use crate::sched::{SchedMode, ThreadStatus, Tid};

    #[test]
    fn test_priority_formula_and_clamping() {
        assert_eq!(priority_for(Fixed::ZERO, 0), PRI_MAX);
        assert_eq!(priority_for(Fixed::ZERO, 2), PRI_MAX - 4);
        assert_eq!(priority_for(Fixed::from_int(8), 0), PRI_MAX - 2);
        // Heavy CPU use plus maximum niceness pins to the floor.
        assert_eq!(priority_for(Fixed::from_int(400), 20), PRI_MIN);
        // Negative nice cannot push past the ceiling.
        assert_eq!(priority_for(Fixed::ZERO, -20), PRI_MAX);
    }

    #[test]
    fn test_running_thread_accumulates_recent_cpu() {
        let mut s = fresh(SchedMode::Mlfq);
        let cur = s.current();
        crate::arch::x86_64::intr::enter_isr();
        for now in 1..=3 {
            on_tick(&mut s, now);
        }
        crate::arch::x86_64::intr::exit_isr();
        let _ = crate::arch::x86_64::intr::take_yield_request();
        assert_eq!(s.thread(cur).recent_cpu.round(), 3);
    }

    #[test]
    fn test_nicer_thread_gets_lower_priority() {
        let mut s = fresh(SchedMode::Mlfq);
        let fair = spawn_thread(&mut s, "fair", 31);
        let nice = spawn_thread(&mut s, "nice", 31);
        s.thread_mut(nice).nice = 5;
        // Same CPU usage so far
        s.thread_mut(fair).recent_cpu = Fixed::from_int(20);
        s.thread_mut(nice).recent_cpu = Fixed::from_int(20);

        update_priorities(&mut s);
        assert!(s.effective(fair) > s.effective(nice));
        assert_eq!(s.ready_front(), Some(fair));
    }

    #[test]
    fn test_load_avg_counts_ready_and_running_not_idle() {
        let mut s = fresh(SchedMode::Mlfq);
        spawn_thread(&mut s, "a", 31);
        // main running + a ready = 2
        assert_eq!(s.ready_thread_count(), 2);

        // With idle on the CPU and an empty queue the count is zero.
        let main = Tid(1);
        s.thread_mut(main).status = ThreadStatus::Blocked;
        s.ready.clear();
        let idle = s.idle_tid();
        s.thread_mut(idle).status = ThreadStatus::Running;
        s.current = idle;
        assert_eq!(s.ready_thread_count(), 0);
    }

    #[test]
    fn test_load_avg_converges_to_ready_count() {
        let mut s = fresh(SchedMode::Mlfq);
        spawn_thread(&mut s, "a", 31);
        // Two runnable threads for a simulated minute
        for _ in 0..6000 {
            update_load_avg(&mut s);
        }
        assert_eq!(s.load_avg.mul_int(100).round(), 200);
    }

    #[test]
    fn test_decay_pulls_recent_cpu_toward_nice_floor() {
        let mut s = fresh(SchedMode::Mlfq);
        let t = spawn_thread(&mut s, "t", 31);
        s.thread_mut(t).recent_cpu = Fixed::from_int(100);
        s.load_avg = Fixed::from_int(1);
        for _ in 0..200 {
            decay_recent_cpu(&mut s);
        }
        // decay = 2/3 each round, nice 0: recent_cpu decays toward 0
        assert_eq!(s.thread(t).recent_cpu.round(), 0);
    }
}
