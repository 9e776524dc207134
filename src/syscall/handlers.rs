/*
 * System Call Handlers
 *
 * One function per syscall. Every handler validates its user pointers
 * with the probe before touching them: a bad pointer terminates the
 * process with status -1, while semantic failures (bad fd, missing
 * file, double close) merely answer -1.
 *
 * User buffers are copied through the process's address space in
 * bounded chunks, so a hostile size cannot pin the kernel in one
 * allocation.
 */

use alloc::string::String;

use crate::arch::x86_64::context::TrapFrame;
use crate::arch::x86_64::intr;
use crate::fs;
use crate::io::File;
use crate::memory::palloc::PAGE_SIZE;
use crate::sched::with_sched;
use crate::userprog::{self, probe, probe::CheckFlags};

/// Copy chunk size for user buffer transfers.
const COPY_CHUNK: usize = 512;

/// Run a pointer check against the calling process's address space.
fn check_user_range(va: u64, size: usize, flags: CheckFlags) -> bool {
    let old = intr::disable();
    let ok = with_sched(|s| {
        let cur = s.current();
        match s.thread_mut(cur).addrspace.as_mut() {
            Some(space) => probe::check_user(space, va, size, flags),
            None => false,
        }
    });
    intr::set_level(old);
    ok
}

/// Validate and copy in a NUL-terminated user string. Strings are
/// bounded by one page, like the command lines they carry.
fn validated_user_str(va: u64) -> Option<String> {
    if !check_user_range(va, 0, CheckFlags::USER | CheckFlags::STR) {
        return None;
    }
    let old = intr::disable();
    let s = with_sched(|s| {
        let cur = s.current();
        s.thread(cur)
            .addrspace
            .as_ref()
            .and_then(|space| space.read_cstr(va, PAGE_SIZE))
    });
    intr::set_level(old);
    s
}

fn copy_from_user(va: u64, buf: &mut [u8]) -> bool {
    let old = intr::disable();
    let ok = with_sched(|s| {
        let cur = s.current();
        s.thread(cur)
            .addrspace
            .as_ref()
            .is_some_and(|space| space.read_bytes(va, buf))
    });
    intr::set_level(old);
    ok
}

fn copy_to_user(va: u64, data: &[u8]) -> bool {
    let old = intr::disable();
    let ok = with_sched(|s| {
        let cur = s.current();
        s.thread_mut(cur)
            .addrspace
            .as_mut()
            .is_some_and(|space| space.write_bytes(va, data))
    });
    intr::set_level(old);
    ok
}

/// Run a closure against the file behind `fd`; None if the fd is not
/// open.
fn with_fd<R>(fd: i32, f: impl FnOnce(&mut File) -> R) -> Option<R> {
    let old = intr::disable();
    let r = with_sched(|s| {
        let cur = s.current();
        s.thread_mut(cur).fd_table.get_mut(fd).map(f)
    });
    intr::set_level(old);
    r
}

pub fn sys_exit(status: i32) -> ! {
    userprog::exit(status)
}

pub fn sys_fork(name_va: u64, parent_frame: &TrapFrame) -> i64 {
    match validated_user_str(name_va) {
        Some(name) => userprog::fork(&name, parent_frame),
        None => userprog::exit(-1),
    }
}

pub fn sys_exec(path_va: u64) -> ! {
    match validated_user_str(path_va) {
        Some(cmdline) => userprog::exec(&cmdline),
        None => userprog::exit(-1),
    }
}

pub fn sys_wait(pid: i64) -> i64 {
    userprog::wait(pid)
}

pub fn sys_create(path_va: u64, size: u64) -> i64 {
    match validated_user_str(path_va) {
        Some(path) => fs::create(&path, size as usize) as i64,
        None => userprog::exit(-1),
    }
}

pub fn sys_remove(path_va: u64) -> i64 {
    match validated_user_str(path_va) {
        Some(path) => fs::remove(&path) as i64,
        None => userprog::exit(-1),
    }
}

pub fn sys_open(path_va: u64) -> i64 {
    let Some(path) = validated_user_str(path_va) else {
        userprog::exit(-1);
    };
    let Some(handle) = fs::open(&path) else {
        return -1;
    };
    let old = intr::disable();
    let fd = with_sched(|s| {
        let cur = s.current();
        s.thread_mut(cur).fd_table.set_fd(File::Stream(handle))
    });
    intr::set_level(old);
    fd as i64
}

pub fn sys_filesize(fd: i32) -> i64 {
    with_fd(fd, |f| f.size()).unwrap_or(-1)
}

pub fn sys_read(fd: i32, buf_va: u64, size: usize) -> i64 {
    if !check_user_range(buf_va, size, CheckFlags::USER | CheckFlags::WRITE) {
        userprog::exit(-1);
    }

    let mut total = 0usize;
    while total < size {
        let want = COPY_CHUNK.min(size - total);
        let mut chunk = [0u8; COPY_CHUNK];
        let n = match with_fd(fd, |f| f.read(&mut chunk[..want])) {
            Some(n) if n >= 0 => n as usize,
            _ => return -1,
        };
        if n > 0 && !copy_to_user(buf_va + total as u64, &chunk[..n]) {
            return -1;
        }
        total += n;
        // Short read: EOF, or the console line ended.
        if n < want {
            break;
        }
        // Console reads stop at the newline even when more would fit.
        if chunk[..n].last() == Some(&b'\n') {
            break;
        }
    }
    total as i64
}

pub fn sys_write(fd: i32, buf_va: u64, size: usize) -> i64 {
    if !check_user_range(buf_va, size, CheckFlags::USER) {
        userprog::exit(-1);
    }

    let mut total = 0usize;
    while total < size {
        let want = COPY_CHUNK.min(size - total);
        let mut chunk = [0u8; COPY_CHUNK];
        if !copy_from_user(buf_va + total as u64, &mut chunk[..want]) {
            return -1;
        }
        let n = match with_fd(fd, |f| f.write(&chunk[..want])) {
            Some(n) if n >= 0 => n as usize,
            _ => return -1,
        };
        total += n;
        if n < want {
            break;
        }
    }
    total as i64
}

pub fn sys_seek(fd: i32, pos: usize) -> i64 {
    with_fd(fd, |f| f.seek(pos)).unwrap_or(-1)
}

pub fn sys_tell(fd: i32) -> i64 {
    with_fd(fd, |f| f.tell()).unwrap_or(-1)
}

pub fn sys_close(fd: i32) -> i64 {
    let old = intr::disable();
    let r = with_sched(|s| {
        let cur = s.current();
        s.thread_mut(cur).fd_table.remove_fd(fd)
    });
    intr::set_level(old);
    r as i64
}
