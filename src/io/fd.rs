/*
 * File Descriptor Table
 *
 * Per-process table mapping small nonnegative integers to open files.
 * Slots 0 and 1 are pre-populated with the console endpoints.
 *
 * Storage is accounted in page-sized chunks of 512 slots: the table
 * starts at one chunk and grows by one chunk (with a copy) each time it
 * fills, the same growth rule the original table used for its raw pages.
 * Every failure path answers -1; fd allocation always returns the lowest
 * free index.
 */

use alloc::vec::Vec;

use super::file::File;
use crate::memory::palloc::PAGE_SIZE;

/// Fd slots per storage page (pointer-sized entries).
pub const FDS_PER_PAGE: usize = PAGE_SIZE / core::mem::size_of::<usize>();

/// Per-process file descriptor table.
#[derive(Debug)]
pub struct FdTable {
    slots: Vec<Option<File>>,
    pages: usize,
    open_count: usize,
}

impl FdTable {
    /// Fresh table with the standard streams installed at 0 and 1.
    pub fn new() -> Self {
        let mut slots = Vec::new();
        slots.resize_with(FDS_PER_PAGE, || None);
        slots[0] = Some(File::Stdin);
        slots[1] = Some(File::Stdout);
        Self {
            slots,
            pages: 1,
            open_count: 2,
        }
    }

    /// Number of open descriptors.
    pub fn open_count(&self) -> usize {
        self.open_count
    }

    /// Capacity in slots (pages * 512).
    pub fn capacity(&self) -> usize {
        self.pages * FDS_PER_PAGE
    }

    /// Install `file` at the lowest free index, growing the table by one
    /// page if it is full. Returns the index, or -1 if the allocation
    /// fails.
    pub fn set_fd(&mut self, file: File) -> i32 {
        if self.open_count < self.capacity() {
            for (idx, slot) in self.slots.iter_mut().enumerate() {
                if slot.is_none() {
                    *slot = Some(file);
                    self.open_count += 1;
                    return idx as i32;
                }
            }
            return -1;
        }

        // Full: grow to pages+1 chunks, copying the existing entries.
        if self.slots.try_reserve_exact(FDS_PER_PAGE).is_err() {
            return -1;
        }
        self.pages += 1;
        self.slots.resize_with(self.pages * FDS_PER_PAGE, || None);

        let idx = self.open_count;
        self.slots[idx] = Some(file);
        self.open_count += 1;
        idx as i32
    }

    /// Close the descriptor, freeing its slot. Returns the fd, or -1 if
    /// it was not open. The console singletons have nothing to free;
    /// dropping a stream closes it.
    pub fn remove_fd(&mut self, fd: i32) -> i32 {
        match self.slot_mut(fd) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                self.open_count -= 1;
                fd
            }
            _ => -1,
        }
    }

    /// If another descriptor already names the same underlying file,
    /// close that older descriptor and move this file into its slot,
    /// coalescing the pair. Returns the surviving index (the old slot if
    /// a duplicate existed, otherwise `fd`), or -1 if `fd` is not open.
    pub fn remove_if_duplicated(&mut self, fd: i32) -> i32 {
        if self.get(fd).is_none() {
            return -1;
        }
        let dup_idx = self.slots.iter().enumerate().position(|(idx, slot)| {
            idx as i32 != fd
                && slot
                    .as_ref()
                    .is_some_and(|f| f.same_file(self.slots[fd as usize].as_ref().unwrap()))
        });
        match dup_idx {
            Some(idx) => {
                self.remove_fd(idx as i32);
                let file = self.slots[fd as usize].take();
                self.slots[idx] = file;
                idx as i32
            }
            None => fd,
        }
    }

    /// Borrow the file at `fd`.
    pub fn get(&self, fd: i32) -> Option<&File> {
        if fd < 0 {
            return None;
        }
        self.slots.get(fd as usize)?.as_ref()
    }

    /// Mutably borrow the file at `fd`.
    pub fn get_mut(&mut self, fd: i32) -> Option<&mut File> {
        self.slot_mut(fd)?.as_mut()
    }

    fn slot_mut(&mut self, fd: i32) -> Option<&mut Option<File>> {
        if fd < 0 {
            return None;
        }
        self.slots.get_mut(fd as usize)
    }

    /// Close every descriptor and release the table storage (process
    /// exit).
    pub fn close_all(&mut self) {
        self.slots.clear();
        self.slots.shrink_to_fit();
        self.pages = 0;
        self.open_count = 0;
    }

    /// Copy for fork: slot-by-slot duplication, same indices, same
    /// capacity.
    pub fn duplicate(&self) -> Result<FdTable, &'static str> {
        let mut slots = Vec::new();
        if slots.try_reserve_exact(self.slots.len()).is_err() {
            return Err("out of memory duplicating fd table");
        }
        for slot in &self.slots {
            slots.push(slot.as_ref().map(|f| f.duplicate()));
        }
        Ok(FdTable {
            slots,
            pages: self.pages,
            open_count: self.open_count,
        })
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs;

    fn stream(path: &str) -> File {
        File::Stream(fs::open(path).unwrap())
    }

    #[test]
    fn test_standard_streams_preinstalled() {
        let t = FdTable::new();
        assert!(matches!(t.get(0), Some(File::Stdin)));
        assert!(matches!(t.get(1), Some(File::Stdout)));
        assert_eq!(t.open_count(), 2);
        assert!(t.get(2).is_none());
        assert!(t.get(-1).is_none());
    }

    #[test]
    fn test_set_fd_returns_lowest_free_index() {
        assert!(fs::install("fd-low", b"x"));
        let mut t = FdTable::new();
        assert_eq!(t.set_fd(stream("fd-low")), 2);
        assert_eq!(t.set_fd(stream("fd-low")), 3);
        assert_eq!(t.remove_fd(2), 2);
        assert_eq!(t.set_fd(stream("fd-low")), 2, "freed slot is reused first");
    }

    #[test]
    fn test_remove_fd_restores_prior_state() {
        assert!(fs::install("fd-restore", b"x"));
        let mut t = FdTable::new();
        let fd = t.set_fd(stream("fd-restore"));
        assert_eq!(t.open_count(), 3);
        assert_eq!(t.remove_fd(fd), fd);
        assert_eq!(t.open_count(), 2);
        assert!(t.get(fd).is_none());
        // Closing twice (or closing a std slot twice) fails the second time
        assert_eq!(t.remove_fd(fd), -1);
        assert_eq!(t.remove_fd(99), -1);
    }

    #[test]
    fn test_growth_by_one_page_chunk() {
        assert!(fs::install("fd-grow", b"x"));
        let mut t = FdTable::new();
        for _ in 0..FDS_PER_PAGE - 2 {
            assert!(t.set_fd(stream("fd-grow")) >= 0);
        }
        assert_eq!(t.capacity(), FDS_PER_PAGE);
        // Table is full; the next insert grows it by exactly one chunk.
        let fd = t.set_fd(stream("fd-grow"));
        assert_eq!(fd, FDS_PER_PAGE as i32);
        assert_eq!(t.capacity(), 2 * FDS_PER_PAGE);
    }

    #[test]
    fn test_remove_if_duplicated_coalesces_same_inode() {
        assert!(fs::install("fd-dup", b"x"));
        assert!(fs::install("fd-other", b"y"));
        let mut t = FdTable::new();
        let first = t.set_fd(stream("fd-dup"));
        let other = t.set_fd(stream("fd-other"));
        let second = t.set_fd(stream("fd-dup"));

        // second collapses into first's slot; the old handle is closed.
        let survivor = t.remove_if_duplicated(second);
        assert_eq!(survivor, first);
        assert!(t.get(second).is_none());
        assert_eq!(t.open_count(), 4); // stdin, stdout, survivor, other

        // No duplicate: the fd is returned unchanged.
        assert_eq!(t.remove_if_duplicated(other), other);
        // Closed fd: -1.
        assert_eq!(t.remove_if_duplicated(second), -1);
    }

    #[test]
    fn test_duplicate_for_fork_preserves_slots() {
        assert!(fs::install("fd-fork", b"abcdef"));
        let mut t = FdTable::new();
        let fd = t.set_fd(stream("fd-fork"));
        if let Some(f) = t.get_mut(fd) {
            let mut buf = [0u8; 2];
            f.read(&mut buf);
        }

        let mut copy = t.duplicate().unwrap();
        assert_eq!(copy.open_count(), t.open_count());
        assert!(matches!(copy.get(0), Some(File::Stdin)));
        // Cursor position travels with the duplicated handle.
        assert_eq!(copy.get(fd).unwrap().tell(), 2);
        // The copies are independent descriptors on one inode.
        assert!(copy.get(fd).unwrap().same_file(t.get(fd).unwrap()));
        assert_eq!(copy.remove_fd(fd), fd);
        assert!(t.get(fd).is_some());
    }

    #[test]
    fn test_close_all_releases_storage() {
        assert!(fs::install("fd-close", b"x"));
        let mut t = FdTable::new();
        t.set_fd(stream("fd-close"));
        t.close_all();
        assert_eq!(t.open_count(), 0);
        assert_eq!(t.capacity(), 0);
        assert!(t.get(0).is_none());
    }
}
