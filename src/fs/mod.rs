/*
 * File System Service
 *
 * The kernel core treats the filesystem as an external collaborator: a
 * flat namespace offering create/remove/open plus per-stream
 * read/write/seek/tell/len/close. This module provides that seam and an
 * in-memory implementation of it, populated from the boot image - enough
 * to run and test everything above it without a disk stack.
 *
 * Identity and write-denial live on the inode, shared by every handle
 * opened on the same file:
 * - inode ids back duplicate detection in the fd table
 * - deny_write is a counter raised for each executing image; while it is
 *   nonzero, writes through ANY handle write nothing
 *
 * The global service is guarded by its own lock, independent of the
 * scheduler's critical sections.
 */

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

/// One file's storage and identity.
#[derive(Debug)]
pub struct Inode {
    id: usize,
    data: Mutex<Vec<u8>>,
    deny_write: AtomicUsize,
}

impl Inode {
    fn new(id: usize, data: Vec<u8>) -> Self {
        Self {
            id,
            data: Mutex::new(data),
            deny_write: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    fn write_denied(&self) -> bool {
        self.deny_write.load(Ordering::SeqCst) > 0
    }
}

/// An open file: an inode reference plus a cursor.
///
/// Dropping the handle is close(); a handle that denied writes lifts its
/// denial on close.
#[derive(Debug)]
pub struct FileHandle {
    inode: Arc<Inode>,
    pos: usize,
    denies_write: bool,
}

impl FileHandle {
    /// File length in bytes.
    pub fn len(&self) -> usize {
        self.inode.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read from the cursor, advancing it. Short reads at EOF.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let data = self.inode.data.lock();
        if self.pos >= data.len() {
            return 0;
        }
        let n = buf.len().min(data.len() - self.pos);
        buf[..n].copy_from_slice(&data[self.pos..self.pos + n]);
        drop(data);
        self.pos += n;
        n
    }

    /// Write at the cursor, advancing it. Files do not grow: writes stop
    /// at EOF, and write nothing while the inode's executable denial is
    /// raised.
    pub fn write(&mut self, buf: &[u8]) -> usize {
        if self.inode.write_denied() {
            return 0;
        }
        let mut data = self.inode.data.lock();
        if self.pos >= data.len() {
            return 0;
        }
        let n = buf.len().min(data.len() - self.pos);
        data[self.pos..self.pos + n].copy_from_slice(&buf[..n]);
        drop(data);
        self.pos += n;
        n
    }

    /// Move the cursor to an absolute position (past EOF is allowed;
    /// reads there return 0).
    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    /// Current cursor position.
    pub fn tell(&self) -> usize {
        self.pos
    }

    /// Deny writes to the underlying inode while this handle lives.
    pub fn deny_write(&mut self) {
        if !self.denies_write {
            self.denies_write = true;
            self.inode.deny_write.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Whether writes to the underlying inode are currently denied.
    pub fn is_deny_write(&self) -> bool {
        self.inode.write_denied()
    }

    /// New handle on the same inode with the same cursor; an active
    /// denial is carried over (and so released only when both close).
    pub fn duplicate(&self) -> FileHandle {
        let mut dup = FileHandle {
            inode: Arc::clone(&self.inode),
            pos: self.pos,
            denies_write: false,
        };
        if self.denies_write {
            dup.deny_write();
        }
        dup
    }

    /// True if both handles refer to the same inode.
    pub fn same_inode(&self, other: &FileHandle) -> bool {
        self.inode.id == other.inode.id
    }

    pub fn inode_id(&self) -> usize {
        self.inode.id
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        if self.denies_write {
            self.inode.deny_write.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// The in-memory filesystem: path -> inode.
pub struct MemFs {
    files: BTreeMap<String, Arc<Inode>>,
    next_inode: usize,
}

impl MemFs {
    pub const fn new() -> Self {
        Self {
            files: BTreeMap::new(),
            next_inode: 1,
        }
    }

    fn create(&mut self, path: &str, size: usize) -> bool {
        if path.is_empty() || self.files.contains_key(path) {
            return false;
        }
        let id = self.next_inode;
        self.next_inode += 1;
        self.files
            .insert(String::from(path), Arc::new(Inode::new(id, alloc::vec![0u8; size])));
        true
    }

    fn install(&mut self, path: &str, contents: &[u8]) -> bool {
        if !self.create(path, 0) {
            return false;
        }
        let inode = self.files.get(path).expect("just created");
        *inode.data.lock() = contents.to_vec();
        true
    }

    fn remove(&mut self, path: &str) -> bool {
        // Unlinks the name; open handles keep their inode alive.
        self.files.remove(path).is_some()
    }

    fn open(&self, path: &str) -> Option<FileHandle> {
        let inode = self.files.get(path)?;
        Some(FileHandle {
            inode: Arc::clone(inode),
            pos: 0,
            denies_write: false,
        })
    }
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

/// Global filesystem instance, behind its own lock.
static FILESYS: Mutex<MemFs> = Mutex::new(MemFs::new());

/// Create an empty file of the given size. False if it already exists.
pub fn create(path: &str, size: usize) -> bool {
    FILESYS.lock().create(path, size)
}

/// Seed a file with contents (boot-image population, test fixtures).
pub fn install(path: &str, contents: &[u8]) -> bool {
    FILESYS.lock().install(path, contents)
}

/// Unlink a file. Open handles remain usable.
pub fn remove(path: &str) -> bool {
    FILESYS.lock().remove(path)
}

/// Open a file, cursor at 0.
pub fn open(path: &str) -> Option<FileHandle> {
    FILESYS.lock().open(path)
}
