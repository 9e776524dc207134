/*
 * Preemptive Priority Scheduler
 *
 * Core of the kernel: owns every thread in the system and decides which
 * one runs. Two cooperating layers:
 *
 * 1. MECHANISM (this module): the scheduler singleton with the thread
 *    arena, the ready/sleep/destruction queues and the interrupt-driven
 *    context switch. All state is guarded by one spin lock taken only
 *    with interrupts disabled - on a single CPU that makes every
 *    operation atomic with respect to the timer.
 *
 * 2. POLICY: priority scheduling with donation (default) or the MLFQ
 *    variant (boot option), selected once at init. Both share the same
 *    ready queue, ordered by effective priority descending with FIFO
 *    ties; they differ only in how priorities are computed.
 *
 * SCHEDULING RULES:
 * ================
 *
 * - The ready queue is kept sorted, so pick-next is pop-front.
 * - unblock() makes a thread Ready but never preempts; callers decide
 *   (yield_if_lower) so they can finish their own critical section first.
 * - The timer tick enforces the TIME_SLICE and requests preemption via
 *   yield-on-interrupt-return whenever a higher-priority thread is ready.
 * - A Dying thread is parked on the destruction queue and reclaimed at
 *   the top of the *next* schedule - never by itself, its stack is still
 *   in use until the switch completes.
 * - The idle thread never appears on the ready queue; it is the fallback
 *   when the queue is empty.
 */

pub mod donation;
pub mod fixed_point;
pub mod mlfqs;
pub mod sleep;
pub mod thread;

pub use thread::{PRI_DEFAULT, PRI_MAX, PRI_MIN, Thread, ThreadStatus, Tid};

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use crate::arch::x86_64::context::{self, TrapFrame};
use crate::arch::x86_64::intr;
use crate::memory::palloc::{self, AllocFlags, PAGE_SIZE, Page};
use crate::sched::fixed_point::Fixed;
use crate::sched::thread::STACK_MAGIC;
use crate::sync::SyncTable;

/// Timer ticks each thread gets before it is forcibly yielded.
pub const TIME_SLICE: u32 = 4;

/// Scheduling policy, fixed at init.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedMode {
    /// Priority scheduling with donation (default).
    Priority,
    /// Multi-level feedback queue; the scheduler owns all priorities.
    Mlfq,
}

/// Global scheduler instance.
static SCHED: Mutex<Option<Sched>> = Mutex::new(None);

/// Mirror of the running thread's tid, readable without the lock.
/// Per-thread under the host harness so parallel tests stay independent.
#[cfg(not(test))]
mod current_mirror {
    use core::sync::atomic::{AtomicUsize, Ordering};

    static CURRENT_TID: AtomicUsize = AtomicUsize::new(0);

    pub(super) fn set(tid: usize) {
        CURRENT_TID.store(tid, Ordering::SeqCst);
    }

    pub(super) fn get() -> usize {
        CURRENT_TID.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod current_mirror {
    use core::cell::Cell;

    std::thread_local! {
        static CURRENT_TID: Cell<usize> = const { Cell::new(0) };
    }

    pub(super) fn set(tid: usize) {
        CURRENT_TID.with(|c| c.set(tid));
    }

    pub(super) fn get() -> usize {
        CURRENT_TID.with(|c| c.get())
    }
}

/// Set once start() has spawned the idle thread; before this the timer
/// must not context-switch.
static SCHED_STARTED: AtomicBool = AtomicBool::new(false);

/// Thread entry signature: a function plus an opaque argument.
pub type ThreadFunc = fn(usize);

/// The scheduler singleton.
pub struct Sched {
    mode: SchedMode,

    /// All live threads, keyed by tid.
    threads: BTreeMap<usize, Thread>,
    /// Tids ready to run, effective priority descending, FIFO ties.
    ready: Vec<Tid>,
    /// Sleeping tids, wake_tick ascending.
    sleepers: Vec<Tid>,
    /// Dying tids whose TCBs are reclaimed at the next schedule.
    destruction: Vec<Tid>,

    current: Tid,
    idle: Tid,
    next_tid: usize,

    /// Ticks the running thread has used of its slice.
    slice_ticks: u32,

    /// MLFQ system load average (17.14 fixed point).
    pub(crate) load_avg: Fixed,

    // Tick statistics by thread category.
    idle_ticks: u64,
    kernel_ticks: u64,
    user_ticks: u64,

    /// All semaphores, locks and condition variables.
    pub(crate) sync: SyncTable,
}

impl Sched {
    /// Build the scheduler and adopt the running boot context as the
    /// initial thread. The boot stack stays in place; the TCB only
    /// exists so the first context switch has somewhere to save into.
    pub fn new(mode: SchedMode) -> Self {
        let mut sync = SyncTable::new();
        let wait_sema = sync.create_sem(0);
        let fork_sema = sync.create_sem(0);
        let exit_sema = sync.create_sem(0);

        let main_tid = Tid(1);
        let mut main = Thread::new(
            main_tid,
            "main",
            PRI_DEFAULT,
            None,
            wait_sema,
            fork_sema,
            exit_sema,
        );
        main.status = ThreadStatus::Running;

        let mut threads = BTreeMap::new();
        threads.insert(main_tid.0, main);
        current_mirror::set(main_tid.0);

        Self {
            mode,
            threads,
            ready: Vec::new(),
            sleepers: Vec::new(),
            destruction: Vec::new(),
            current: main_tid,
            idle: Tid(0),
            next_tid: 2,
            slice_ticks: 0,
            load_avg: Fixed::ZERO,
            idle_ticks: 0,
            kernel_ticks: 0,
            user_ticks: 0,
            sync,
        }
    }

    pub fn mode(&self) -> SchedMode {
        self.mode
    }

    pub fn current(&self) -> Tid {
        self.current
    }

    pub fn idle_tid(&self) -> Tid {
        self.idle
    }

    pub fn thread(&self, tid: Tid) -> &Thread {
        self.threads.get(&tid.0).expect("stale tid")
    }

    pub fn thread_mut(&mut self, tid: Tid) -> &mut Thread {
        self.threads.get_mut(&tid.0).expect("stale tid")
    }

    pub fn get_thread(&self, tid: Tid) -> Option<&Thread> {
        self.threads.get(&tid.0)
    }

    pub fn get_thread_mut(&mut self, tid: Tid) -> Option<&mut Thread> {
        self.threads.get_mut(&tid.0)
    }

    /// Effective priority of a thread, the value every scheduling
    /// decision is based on.
    pub fn effective(&self, tid: Tid) -> i32 {
        self.thread(tid).effective_priority
    }

    pub(crate) fn all_tids(&self) -> Vec<Tid> {
        self.threads.keys().map(|&k| Tid(k)).collect()
    }

    fn allocate_tid(&mut self) -> Tid {
        let tid = Tid(self.next_tid);
        self.next_tid += 1;
        tid
    }

    /// Create a new kernel thread in the Blocked state.
    ///
    /// The thread's synthetic frame makes the first switch-in land in the
    /// kernel_thread_entry trampoline with `func`/`aux` in the argument
    /// registers, exactly as if it had been interrupted at that point.
    /// The caller unblocks it once any extra wiring is done.
    pub(crate) fn create_thread(
        &mut self,
        name: &str,
        priority: i32,
        mut stack: Page,
        func: ThreadFunc,
        aux: usize,
    ) -> Tid {
        let tid = self.allocate_tid();
        let wait_sema = self.sync.create_sem(0);
        let fork_sema = self.sync.create_sem(0);
        let exit_sema = self.sync.create_sem(0);

        // Guard word at the base of the stack, overwritten only by a
        // stack overflow.
        stack.bytes_mut()[..8].copy_from_slice(&STACK_MAGIC.to_le_bytes());
        let stack_top = stack.base_addr() as u64 + PAGE_SIZE as u64;

        let priority = match self.mode {
            SchedMode::Priority => priority,
            // The MLFQ scheduler owns priorities from the first tick.
            SchedMode::Mlfq => mlfqs::priority_for(Fixed::ZERO, 0),
        };

        let mut t = Thread::new(
            tid,
            name,
            priority,
            Some(stack),
            wait_sema,
            fork_sema,
            exit_sema,
        );
        t.frame.rip = kernel_thread_entry as usize as u64;
        t.frame.rdi = func as usize as u64;
        t.frame.rsi = aux as u64;
        // Top word of the stack is a null fake return address; entry
        // therefore sees the stack alignment of a normal call.
        t.frame.rsp = stack_top - 8;

        log::debug!("created thread '{}' with tid {}", t.name.as_str(), tid);
        self.threads.insert(tid.0, t);
        tid
    }

    /// Insert a tid into the ready queue, keeping it sorted by effective
    /// priority descending; equal priorities stay FIFO.
    pub(crate) fn insert_ready(&mut self, tid: Tid) {
        if tid == self.idle {
            return;
        }
        let eff = self.effective(tid);
        let pos = self
            .ready
            .iter()
            .position(|&t| self.effective(t) < eff)
            .unwrap_or(self.ready.len());
        self.ready.insert(pos, tid);
    }

    /// Reposition a tid after its effective priority changed.
    pub(crate) fn resort_ready(&mut self, tid: Tid) {
        if let Some(pos) = self.ready.iter().position(|&t| t == tid) {
            self.ready.remove(pos);
            self.insert_ready(tid);
        }
    }

    /// Re-sort the whole ready queue (stable, so ties stay FIFO). Used
    /// after MLFQ recomputes every priority at once.
    pub(crate) fn sort_ready(&mut self) {
        let mut queue = core::mem::take(&mut self.ready);
        queue.sort_by(|&a, &b| self.effective(b).cmp(&self.effective(a)));
        self.ready = queue;
    }

    pub(crate) fn ready_front(&self) -> Option<Tid> {
        self.ready.first().copied()
    }

    pub(crate) fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Transition a Blocked thread to Ready. Does NOT preempt: the
    /// caller may be mid-critical-section and decides separately whether
    /// to yield.
    pub(crate) fn unblock(&mut self, tid: Tid) {
        assert!(
            self.thread(tid).status == ThreadStatus::Blocked,
            "unblock of non-blocked thread {tid}"
        );
        self.insert_ready(tid);
        self.thread_mut(tid).status = ThreadStatus::Ready;
    }

    /// Mark the running thread Blocked. The caller must follow up with a
    /// reschedule; until then the thread keeps running on borrowed time.
    pub(crate) fn block_current(&mut self) {
        let cur = self.current;
        debug_assert!(self.thread(cur).status == ThreadStatus::Running);
        self.thread_mut(cur).status = ThreadStatus::Blocked;
    }

    /// Per-tick bookkeeping, run from the timer ISR with IRQs off.
    ///
    /// Updates the category counters, drives the MLFQ maintenance
    /// cadence, wakes expired sleepers, and requests preemption on
    /// interrupt return when the slice is used up or a higher-priority
    /// thread became ready.
    pub(crate) fn tick(&mut self, now: u64) {
        let cur = self.current;
        if cur == self.idle {
            self.idle_ticks += 1;
        } else if self.thread(cur).is_user() {
            self.user_ticks += 1;
        } else {
            self.kernel_ticks += 1;
        }

        if self.mode == SchedMode::Mlfq {
            mlfqs::on_tick(self, now);
        }

        self.wake_expired(now);

        self.slice_ticks += 1;
        if self.slice_ticks >= TIME_SLICE {
            intr::yield_on_return();
        }
        if let Some(front) = self.ready_front() {
            if self.effective(front) > self.effective(cur) {
                intr::yield_on_return();
            }
        }
    }

    /// Reclaim TCBs parked on the destruction queue. Runs at the top of
    /// every schedule, i.e. strictly after control has left the dying
    /// thread's stack. No logging here: this runs in interrupt context,
    /// where taking the console lock could deadlock against the thread
    /// it interrupted.
    fn reap_dying(&mut self) {
        while let Some(victim) = self.destruction.pop() {
            debug_assert!(victim != self.current);
            if let Some(t) = self.threads.remove(&victim.0) {
                self.sync.destroy_sem(t.wait_sema);
                self.sync.destroy_sem(t.fork_sema);
                self.sync.destroy_sem(t.exit_sema);
            }
        }
    }

    /// Pick the next thread to run and update all scheduling state.
    ///
    /// Dispositions the outgoing thread by status (Running threads go
    /// back to the ready queue, Dying threads to the destruction queue,
    /// Blocked threads are already parked on a wait list), then pops the
    /// highest-priority ready thread, falling back to idle.
    pub(crate) fn reschedule(&mut self) -> Tid {
        self.reap_dying();

        let cur = self.current;
        self.thread(cur).check_stack_canary();
        match self.thread(cur).status {
            ThreadStatus::Running => {
                self.insert_ready(cur);
                self.thread_mut(cur).status = ThreadStatus::Ready;
            }
            ThreadStatus::Dying => self.destruction.push(cur),
            ThreadStatus::Blocked => {}
            ThreadStatus::Ready => unreachable!("running thread already on ready queue"),
        }

        let next = if self.ready.is_empty() {
            self.idle
        } else {
            self.ready.remove(0)
        };
        self.thread_mut(next).status = ThreadStatus::Running;
        self.current = next;
        self.slice_ticks = 0;
        current_mirror::set(next.0);

        // Install the incoming thread's address space (no-op for kernel
        // threads, which run on the shared kernel mappings).
        if let Some(space) = &self.thread(next).addrspace {
            space.activate();
        }
        next
    }

    /// Count of ready-or-running threads, excluding idle (MLFQ input).
    pub(crate) fn ready_thread_count(&self) -> usize {
        let running = if self.current != self.idle { 1 } else { 0 };
        self.ready.len() + running
    }
}

// ============================================================================
// GLOBAL API
// ============================================================================

/// Run a closure against the scheduler singleton.
///
/// The caller must have interrupts disabled: the timer ISR takes the same
/// lock, and a tick landing while we hold it would deadlock the CPU.
pub(crate) fn with_sched<R>(f: impl FnOnce(&mut Sched) -> R) -> R {
    let mut guard = SCHED.lock();
    f(guard.as_mut().expect("scheduler not initialized"))
}

/// Initialize the scheduler, adopting the boot context as thread "main".
pub fn init(mode: SchedMode) {
    let old = intr::disable();
    *SCHED.lock() = Some(Sched::new(mode));
    intr::set_level(old);
    log::info!("scheduler initialized (mode: {:?})", mode);
}

/// Spawn the idle thread and enable preemptive scheduling.
pub fn start() {
    let idle_stack = palloc::alloc_page(AllocFlags::ZERO).expect("no page for idle stack");
    let old = intr::disable();
    with_sched(|s| {
        let tid = s.create_thread("idle", PRI_MIN, idle_stack, idle_main, 0);
        s.idle = tid;
        // Idle is the ready-queue-empty fallback; it is never queued.
        s.thread_mut(tid).status = ThreadStatus::Ready;
    });
    intr::set_level(old);
    SCHED_STARTED.store(true, Ordering::SeqCst);
    log::info!("scheduler started - preemption active");
}

pub fn is_started() -> bool {
    SCHED_STARTED.load(Ordering::SeqCst)
}

/// Create a new kernel thread running `func(aux)` and make it ready.
///
/// The new thread may begin running before this returns; if it has a
/// higher effective priority it will preempt the caller immediately.
pub fn spawn(name: &str, priority: i32, func: ThreadFunc, aux: usize) -> Result<Tid, &'static str> {
    let stack = palloc::alloc_page(AllocFlags::ZERO).ok_or("out of kernel pages")?;

    let old = intr::disable();
    let tid = with_sched(|s| {
        let tid = s.create_thread(name, priority, stack, func, aux);
        s.unblock(tid);
        tid
    });
    intr::set_level(old);

    yield_if_lower();
    Ok(tid)
}

/// Tid of the running thread.
pub fn current_tid() -> Tid {
    Tid(current_mirror::get())
}

/// Name of the running thread.
pub fn current_name() -> heapless::String<{ thread::THREAD_NAME_MAX }> {
    let old = intr::disable();
    let name = with_sched(|s| s.thread(s.current).name.clone());
    intr::set_level(old);
    name
}

/// Voluntarily give up the CPU; the thread stays runnable and may be
/// rescheduled immediately.
pub fn yield_now() {
    debug_assert!(!intr::in_isr());
    if !is_started() {
        return;
    }
    context::trigger_reschedule();
}

/// Yield only if the head of the ready queue has a strictly higher
/// effective priority than the running thread. From an ISR the switch is
/// deferred to interrupt return.
pub fn yield_if_lower() {
    if !is_started() {
        return;
    }
    let old = intr::disable();
    let should = with_sched(|s| match s.ready_front() {
        Some(front) => s.effective(front) > s.effective(s.current),
        None => false,
    });
    if should {
        if intr::in_isr() {
            intr::yield_on_return();
        } else {
            context::trigger_reschedule();
        }
    }
    intr::set_level(old);
}

/// Terminate the running thread. Never returns.
///
/// User processes run their exit protocol (fd teardown, page table
/// destruction, parent handshake) first; then the thread is marked Dying
/// and the TCB is reclaimed at the next schedule.
pub fn thread_exit() -> ! {
    debug_assert!(!intr::in_isr());

    crate::userprog::process_exit();

    intr::disable();
    with_sched(|s| {
        let cur = s.current;
        s.thread_mut(cur).status = ThreadStatus::Dying;
    });
    context::trigger_reschedule();
    unreachable!("dying thread was rescheduled");
}

/// Set the running thread's base priority and re-evaluate donations.
///
/// Suppressed under MLFQ (the scheduler owns priorities there), but the
/// unconditional yield is kept so the call remains a scheduling point.
pub fn set_priority(new_priority: i32) {
    debug_assert!((PRI_MIN..=PRI_MAX).contains(&new_priority));
    let old = intr::disable();
    with_sched(|s| {
        if s.mode() != SchedMode::Mlfq {
            let cur = s.current;
            s.thread_mut(cur).priority = new_priority;
            // Donors whose effective priority no longer exceeds the new
            // base simply stop mattering in the recompute.
            s.refresh_effective(cur);
        }
    });
    intr::set_level(old);
    yield_now();
}

/// Effective priority of the running thread.
pub fn get_priority() -> i32 {
    let old = intr::disable();
    let p = with_sched(|s| s.effective(s.current));
    intr::set_level(old);
    p
}

/// Set the running thread's nice value and recompute its MLFQ priority.
pub fn set_nice(nice: i32) {
    let nice = nice.clamp(thread::NICE_MIN, thread::NICE_MAX);
    let old = intr::disable();
    with_sched(|s| {
        let cur = s.current;
        s.thread_mut(cur).nice = nice;
        if s.mode() == SchedMode::Mlfq {
            let recent = s.thread(cur).recent_cpu;
            let p = mlfqs::priority_for(recent, nice);
            let t = s.thread_mut(cur);
            t.priority = p;
            t.effective_priority = p;
        }
    });
    intr::set_level(old);
}

/// Nice value of the running thread.
pub fn get_nice() -> i32 {
    let old = intr::disable();
    let n = with_sched(|s| s.thread(s.current).nice);
    intr::set_level(old);
    n
}

/// 100x the system load average, rounded to nearest.
pub fn load_avg_x100() -> i32 {
    let old = intr::disable();
    let v = with_sched(|s| s.load_avg.mul_int(100).round());
    intr::set_level(old);
    v
}

/// 100x the running thread's recent_cpu, rounded to nearest.
pub fn recent_cpu_x100() -> i32 {
    let old = intr::disable();
    let v = with_sched(|s| s.thread(s.current).recent_cpu.mul_int(100).round());
    intr::set_level(old);
    v
}

/// Dump tick statistics.
pub fn print_stats() {
    let old = intr::disable();
    let (idle, kernel, user) =
        with_sched(|s| (s.idle_ticks, s.kernel_ticks, s.user_ticks));
    intr::set_level(old);
    log::info!("Thread: {idle} idle ticks, {kernel} kernel ticks, {user} user ticks");
}

// ============================================================================
// INTERRUPT-SIDE ENTRY POINTS
// ============================================================================

/// Timer interrupt dispatch, called from the naked IRQ0 entry with a
/// pointer to the interrupted context on the stack.
///
/// Returns the context to resume: the interrupted one, or - when tick
/// processing requested preemption - the next thread's saved frame.
pub(crate) extern "C" fn timer_interrupt_dispatch(ctx: *const TrapFrame) -> *const TrapFrame {
    intr::enter_isr();
    let now = crate::utils::timer::on_tick();

    let mut resume = ctx;
    if is_started() {
        let mut guard = SCHED.lock();
        if let Some(s) = guard.as_mut() {
            s.tick(now);
            if intr::take_yield_request() {
                let cur = s.current;
                s.thread_mut(cur).frame = unsafe { *ctx };
                let next = s.reschedule();
                resume = &s.thread(next).frame as *const TrapFrame;
            }
        }
    }

    crate::arch::x86_64::pic::end_of_interrupt(context::TIMER_VECTOR);
    intr::exit_isr();
    resume
}

/// Voluntary yield dispatch (INT 0x81). Unlike the timer path this is a
/// synchronous trap on behalf of the running thread, so it is not an
/// external-interrupt context; it always reschedules.
pub(crate) extern "C" fn yield_interrupt_dispatch(ctx: *const TrapFrame) -> *const TrapFrame {
    if !is_started() {
        return ctx;
    }
    let mut guard = SCHED.lock();
    match guard.as_mut() {
        Some(s) => {
            let cur = s.current;
            s.thread_mut(cur).frame = unsafe { *ctx };
            let next = s.reschedule();
            &s.thread(next).frame as *const TrapFrame
        }
        None => ctx,
    }
}

// ============================================================================
// THREAD ENTRY TRAMPOLINES
// ============================================================================

/// First code every kernel thread runs, entered via iretq from the
/// synthetic frame built in create_thread. The scheduler switched to us
/// with its critical section already closed, so interrupts go back on,
/// the thread function runs, and a plain return becomes thread_exit.
extern "C" fn kernel_thread_entry(func: usize, aux: usize) -> ! {
    intr::enable();
    let f: ThreadFunc = unsafe { core::mem::transmute(func) };
    f(aux);
    thread_exit();
}

/// Idle thread: runs at PRI_MIN when the ready queue is empty.
///
/// `sti; hlt` executes atomically - sti holds interrupts off until the
/// instruction after it completes, so a wakeup cannot slip between the
/// enable and the halt and waste a full tick.
fn idle_main(_aux: usize) {
    loop {
        #[cfg(not(test))]
        x86_64::instructions::interrupts::enable_and_hlt();
        #[cfg(test)]
        break;
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Helpers for driving a Sched instance directly in unit tests,
    //! standing in for the interrupt path.

    use super::*;

    /// Build a started scheduler with an idle thread, as after
    /// init() + start().
    pub fn fresh(mode: SchedMode) -> Sched {
        let mut s = Sched::new(mode);
        let stack = palloc::alloc_page(AllocFlags::ZERO).unwrap();
        let tid = s.create_thread("idle", PRI_MIN, stack, idle_main, 0);
        s.idle = tid;
        s.thread_mut(tid).status = ThreadStatus::Ready;
        s
    }

    /// Spawn a thread that would run `idle_main` (the body is never
    /// executed in tests) and make it ready.
    pub fn spawn_thread(s: &mut Sched, name: &str, priority: i32) -> Tid {
        let stack = palloc::alloc_page(AllocFlags::ZERO).unwrap();
        let tid = s.create_thread(name, priority, stack, idle_main, 0);
        s.unblock(tid);
        tid
    }

    /// Force `tid` onto the CPU, parking the previous runner on the
    /// ready queue, as a context switch would.
    pub fn run_as(s: &mut Sched, tid: Tid) {
        let cur = s.current;
        if s.thread(cur).status == ThreadStatus::Running {
            s.thread_mut(cur).status = ThreadStatus::Ready;
            s.insert_ready(cur);
        }
        s.ready.retain(|&t| t != tid);
        s.thread_mut(tid).status = ThreadStatus::Running;
        s.current = tid;
    }
}
