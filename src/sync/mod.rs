/*
 * Synchronization Primitives
 *
 * Semaphores, locks and condition variables, built directly on the
 * scheduler's block/unblock operations. The primitives are kernel objects
 * identified by small ids and stored in a table inside the scheduler
 * singleton: everything a wakeup decision needs (waiter lists, holder
 * fields, thread priorities) then lives behind one critical section.
 *
 * All mutation happens with interrupts disabled; on a single CPU that is
 * the entire concurrency story (no spinning, no atomics in the hot path).
 */

pub mod condvar;
pub mod lock;
pub mod semaphore;

pub use condvar::CondVar;
pub use lock::Lock;
pub use semaphore::Semaphore;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::sched::thread::Tid;

/// Semaphore identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SemId(pub usize);

/// Lock identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LockId(pub usize);

/// Condition variable identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CondId(pub usize);

/// A counting semaphore: a nonnegative value plus its waiter list.
#[derive(Debug)]
pub struct SemState {
    pub value: usize,
    /// Threads blocked in down(); up() wakes the one with the highest
    /// effective priority, FIFO among equals.
    pub waiters: Vec<Tid>,
}

/// A lock: a binary semaphore with an owner.
///
/// holder is Some exactly while the semaphore value is 0 and some thread
/// has completed acquire without the matching release.
#[derive(Debug)]
pub struct LockState {
    pub holder: Option<Tid>,
    pub sema: SemId,
}

/// A condition variable: each waiter parks on its own private semaphore.
#[derive(Debug)]
pub struct CondState {
    pub waiters: Vec<SemId>,
}

/// Table of all live synchronization objects, owned by the scheduler.
#[derive(Debug)]
pub struct SyncTable {
    sems: BTreeMap<usize, SemState>,
    locks: BTreeMap<usize, LockState>,
    conds: BTreeMap<usize, CondState>,
    next_id: usize,
}

impl SyncTable {
    pub fn new() -> Self {
        Self {
            sems: BTreeMap::new(),
            locks: BTreeMap::new(),
            conds: BTreeMap::new(),
            next_id: 1,
        }
    }

    fn alloc_id(&mut self) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn create_sem(&mut self, value: usize) -> SemId {
        let id = self.alloc_id();
        self.sems.insert(
            id,
            SemState {
                value,
                waiters: Vec::new(),
            },
        );
        SemId(id)
    }

    pub fn create_lock(&mut self) -> LockId {
        let sema = self.create_sem(1);
        let id = self.alloc_id();
        self.locks.insert(id, LockState { holder: None, sema });
        LockId(id)
    }

    pub fn create_cond(&mut self) -> CondId {
        let id = self.alloc_id();
        self.conds.insert(
            id,
            CondState {
                waiters: Vec::new(),
            },
        );
        CondId(id)
    }

    pub fn destroy_sem(&mut self, id: SemId) {
        let state = self.sems.remove(&id.0);
        debug_assert!(state.is_none_or(|s| s.waiters.is_empty()));
    }

    pub fn sem(&self, id: SemId) -> &SemState {
        self.sems.get(&id.0).expect("stale semaphore id")
    }

    pub fn sem_mut(&mut self, id: SemId) -> &mut SemState {
        self.sems.get_mut(&id.0).expect("stale semaphore id")
    }

    pub fn lock(&self, id: LockId) -> &LockState {
        self.locks.get(&id.0).expect("stale lock id")
    }

    pub fn lock_mut(&mut self, id: LockId) -> &mut LockState {
        self.locks.get_mut(&id.0).expect("stale lock id")
    }

    pub fn cond(&self, id: CondId) -> &CondState {
        self.conds.get(&id.0).expect("stale condvar id")
    }

    pub fn cond_mut(&mut self, id: CondId) -> &mut CondState {
        self.conds.get_mut(&id.0).expect("stale condvar id")
    }
}

impl Default for SyncTable {
    fn default() -> Self {
        Self::new()
    }
}
