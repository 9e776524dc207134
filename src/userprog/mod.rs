/*
 * User Process Supervisor
 *
 * Process creation and teardown on top of the thread core. A process is
 * a thread that owns an address space; everything else (fd table, the
 * three handshake semaphores, parent/child links) lives in the TCB.
 *
 * The fork/wait/exit protocol:
 *
 * - fork: the parent spawns a kernel thread that duplicates the user
 *   pages and fd table, sets the child's rax to 0, signals the parent's
 *   fork_sema and irets into userspace. The parent sleeps on fork_sema
 *   and then inspects its youngest child: exit status -1 means the
 *   duplication failed.
 * - wait: the parent downs the child's wait_sema (posted by exit), reads
 *   the exit status, unlinks the child and posts exit_sema so it can
 *   finish dying. A tid that is not a live child answers -1, which also
 *   makes a second wait on the same child -1.
 * - exit: closes the fd table, destroys the page table, prints the exit
 *   message for user processes, then runs the parent handshake before
 *   entering the scheduler's dying path.
 */

pub mod load;
pub mod probe;

use alloc::boxed::Box;
use alloc::string::String;

use crate::arch::x86_64::{context, intr};
use crate::io::File;
use crate::sched::thread::PRI_DEFAULT;
use crate::sched::{self, Tid, with_sched};
use crate::sync::Semaphore;

/// Context handed to a forked child's kernel-side half.
struct ForkAux {
    parent: Tid,
    frame: context::TrapFrame,
}

/// Context handed to the initial process launcher.
struct InitAux {
    parent: Tid,
    cmdline: String,
}

/// Launch the first user process from `cmdline` ("prog arg...").
///
/// Spawns a thread that registers itself as our child and execs the
/// command; returns once the child has linked itself in, so a following
/// wait() can always find it.
pub fn spawn_initial(cmdline: &str) -> Result<Tid, &'static str> {
    let parent = sched::current_tid();
    let name = cmdline.split_whitespace().next().ok_or("empty command line")?;
    let aux = Box::new(InitAux {
        parent,
        cmdline: String::from(cmdline),
    });
    let aux_ptr = Box::into_raw(aux);

    let tid = match sched::spawn(name, PRI_DEFAULT, initd, aux_ptr as usize) {
        Ok(tid) => tid,
        Err(e) => {
            drop(unsafe { Box::from_raw(aux_ptr) });
            return Err(e);
        }
    };

    let handshake = {
        let old = intr::disable();
        let sema = with_sched(|s| Semaphore::from_id(s.thread(parent).wait_sema));
        intr::set_level(old);
        sema
    };
    handshake.down();
    Ok(tid)
}

/// Thread body of the initial process: link into the parent, signal it,
/// and become the user program.
fn initd(aux: usize) {
    let aux = unsafe { Box::from_raw(aux as *mut InitAux) };
    let cur = sched::current_tid();

    let old = intr::disable();
    let handshake = with_sched(|s| {
        s.thread_mut(cur).parent = Some(aux.parent);
        s.thread_mut(aux.parent).children.push(cur);
        Semaphore::from_id(s.thread(aux.parent).wait_sema)
    });
    intr::set_level(old);
    handshake.up();

    exec(&aux.cmdline);
}

/// Clone the current process. Returns the child tid to the parent, -1 on
/// failure; the child resumes in userspace at `parent_frame` with rax 0.
pub fn fork(name: &str, parent_frame: &context::TrapFrame) -> i64 {
    let parent = sched::current_tid();
    let aux = Box::new(ForkAux {
        parent,
        frame: *parent_frame,
    });
    let aux_ptr = Box::into_raw(aux);

    let child = match sched::spawn(name, PRI_DEFAULT, do_fork, aux_ptr as usize) {
        Ok(tid) => tid,
        Err(e) => {
            drop(unsafe { Box::from_raw(aux_ptr) });
            log::warn!("fork: {e}");
            return -1;
        }
    };

    // Sleep until the child finishes (or abandons) duplication.
    let old = intr::disable();
    let fork_sema = with_sched(|s| Semaphore::from_id(s.thread(parent).fork_sema));
    intr::set_level(old);
    fork_sema.down();

    let old = intr::disable();
    let verdict = with_sched(|s| match s.thread(parent).children.last() {
        None => -1,
        Some(&youngest) => {
            if s.thread(youngest).exit_status == -1 {
                -1
            } else {
                child.0 as i64
            }
        }
    });
    intr::set_level(old);
    verdict
}

/// Kernel-side half of a forked child: duplicate the parent, then iret
/// into the copied user context.
fn do_fork(aux: usize) {
    let aux = unsafe { Box::from_raw(aux as *mut ForkAux) };
    let parent = aux.parent;
    let mut frame = aux.frame;
    let cur = sched::current_tid();

    let old = intr::disable();
    let outcome: Result<Semaphore, &'static str> = with_sched(|s| {
        s.thread_mut(cur).parent = Some(parent);
        s.thread_mut(parent).children.push(cur);

        // Every mapped user page is copied; read-only pages stay
        // read-only, writable stay writable.
        if let Some(space) = s.thread(parent).addrspace.as_ref() {
            let copy = space.duplicate()?;
            s.thread_mut(cur).addrspace = Some(copy);
        }
        let fds = s.thread(parent).fd_table.duplicate()?;
        s.thread_mut(cur).fd_table = fds;

        if let Some(space) = s.thread(cur).addrspace.as_ref() {
            space.activate();
        }
        Ok(Semaphore::from_id(s.thread(parent).fork_sema))
    });
    intr::set_level(old);

    match outcome {
        Ok(fork_sema) => {
            // The child's fork() returns 0.
            frame.rax = 0;
            fork_sema.up();
            unsafe { context::do_iret(&frame) }
        }
        Err(e) => {
            log::warn!("fork child {cur}: {e}");
            exit(-1);
        }
    }
}

/// Replace the current process image with `cmdline`. Does not return:
/// on success control irets into the new image, on failure the thread
/// exits with status -1.
pub fn exec(cmdline: &str) -> ! {
    let cur = sched::current_tid();

    // The old image dies first, whatever happens next.
    process_cleanup();

    let mut frame = context::TrapFrame::user_default();
    match load::load(cmdline, &mut frame) {
        Ok(image) => {
            let old = intr::disable();
            let fd = with_sched(|s| {
                let t = s.thread_mut(cur);
                t.addrspace = Some(image.space);
                t.addrspace.as_ref().expect("just installed").activate();
                t.fd_table.set_fd(File::Stream(image.exec_file))
            });
            intr::set_level(old);
            if fd == -1 {
                exit(-1);
            }
            unsafe { context::do_iret(&frame) }
        }
        Err(e) => {
            log::warn!("load: {cmdline}: {e}");
            exit(-1);
        }
    }
}

/// Wait for child `child_tid` to exit and collect its status. Returns
/// -1 if the tid is not an un-waited child of the caller.
pub fn wait(child_tid: i64) -> i64 {
    let cur = sched::current_tid();

    let old = intr::disable();
    let found = with_sched(|s| {
        s.thread(cur)
            .children
            .iter()
            .find(|c| c.0 as i64 == child_tid)
            .copied()
            .map(|child| (child, Semaphore::from_id(s.thread(child).wait_sema)))
    });
    intr::set_level(old);

    let Some((child, wait_sema)) = found else {
        return -1;
    };

    // Blocks until the child's exit posts its status.
    wait_sema.down();

    let old = intr::disable();
    let (status, exit_sema) = with_sched(|s| {
        let status = s.thread(child).exit_status;
        s.thread_mut(cur).children.retain(|&c| c != child);
        (status, Semaphore::from_id(s.thread(child).exit_sema))
    });
    intr::set_level(old);

    // Let the child finish dying.
    exit_sema.up();
    status as i64
}

/// Terminate the current process with `status`.
pub fn exit(status: i32) -> ! {
    let cur = sched::current_tid();
    let old = intr::disable();
    with_sched(|s| s.thread_mut(cur).exit_status = status);
    intr::set_level(old);
    sched::thread_exit();
}

/// Per-thread exit protocol, invoked by thread_exit() for every dying
/// thread (kernel threads simply fall through most of it).
pub(crate) fn process_exit() {
    let cur = sched::current_tid();

    let old = intr::disable();
    let (was_user, parent, status, name) = with_sched(|s| {
        let t = s.thread_mut(cur);
        // Closing the descriptors also releases the table's pages and
        // drops the executable's write denial.
        t.fd_table.close_all();
        (t.is_user(), t.parent, t.exit_status, t.name.clone())
    });
    intr::set_level(old);

    process_cleanup();

    let Some(parent) = parent else {
        return;
    };

    if was_user {
        crate::kprint!("{}: exit({})\n", name.as_str(), status);
    }

    let old = intr::disable();
    let (fork_release_sema, wait_sema, exit_sema) = with_sched(|s| {
        // A parent blocked in fork() on its youngest child must be
        // released even when that child dies instead of reaching
        // userspace.
        let parent_mid_fork = s.get_thread(parent).is_some_and(|p| {
            p.children.last() == Some(&cur) && s.sema_has_waiters(p.fork_sema)
        });
        let fork_release_sema =
            parent_mid_fork.then(|| Semaphore::from_id(s.thread(parent).fork_sema));
        (
            fork_release_sema,
            Semaphore::from_id(s.thread(cur).wait_sema),
            Semaphore::from_id(s.thread(cur).exit_sema),
        )
    });
    intr::set_level(old);

    if let Some(sema) = fork_release_sema {
        sema.up();
    }
    wait_sema.up();
    // Hold the TCB (and the exit status in it) until the parent has
    // acknowledged; reaping happens on the far side of this down.
    exit_sema.down();
}

/// Destroy the current process's address space and fall back to the
/// kernel-only page tables.
pub(crate) fn process_cleanup() {
    let cur = sched::current_tid();
    let old = intr::disable();
    let space = with_sched(|s| s.thread_mut(cur).addrspace.take());
    intr::set_level(old);
    // Dropped outside the critical section; Drop tears down the
    // mappings after the kernel root is already active again.
    drop(space);
}
