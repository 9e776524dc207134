/*
 * Per-Process Address Space
 *
 * Each user process owns an AddressSpace: the page-table root mapping
 * user virtual pages to physical frames with a writable bit. The walk
 * is kept as an explicit map from page-aligned VA to owned frame; the
 * MMU-facing side (loading the root on context switch) is the activate
 * hook.
 *
 * Memory layout:
 *
 * USERSPACE:
 * 0x0000000000000000 - 0x0000800000000000   user range (48-bit canonical)
 *                      0x0000000047480000   initial stack top, grows down
 *
 * Everything above the user range belongs to the kernel and is shared
 * across all address spaces.
 */

use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicUsize, Ordering};

use super::palloc::{self, AllocFlags, PAGE_SIZE, Page};

/// Exclusive upper bound of user virtual addresses.
pub const USER_LIMIT: u64 = 0x0000_8000_0000_0000;

/// Top of the initial user stack; the stack grows downward from here.
pub const USER_STACK: u64 = 0x4748_0000;

/// Address-space id counter (models the page-table root handle).
static NEXT_ASID: AtomicUsize = AtomicUsize::new(1);

/// Root currently installed on the CPU (0 = kernel-only mappings).
static ACTIVE_ASID: AtomicUsize = AtomicUsize::new(0);

/// Round an address down to its page base.
pub fn page_round_down(va: u64) -> u64 {
    va & !(PAGE_SIZE as u64 - 1)
}

/// Offset of an address within its page.
pub fn page_offset(va: u64) -> usize {
    (va & (PAGE_SIZE as u64 - 1)) as usize
}

/// True for addresses inside the user range.
pub fn is_user_vaddr(va: u64) -> bool {
    va < USER_LIMIT
}

/// One mapped user page.
struct UserPage {
    frame: Page,
    writable: bool,
}

/// A user address space: page-table root plus its mappings.
pub struct AddressSpace {
    asid: usize,
    pages: BTreeMap<u64, UserPage>,
}

impl AddressSpace {
    /// Create an empty address space (kernel mappings are implicit).
    pub fn new() -> Option<Self> {
        Some(Self {
            asid: NEXT_ASID.fetch_add(1, Ordering::SeqCst),
            pages: BTreeMap::new(),
        })
    }

    /// Map `frame` at the page-aligned address `va`.
    ///
    /// Fails if `va` is unaligned, outside the user range, or already
    /// mapped.
    pub fn map(&mut self, va: u64, frame: Page, writable: bool) -> bool {
        if page_offset(va) != 0 || !is_user_vaddr(va) || self.pages.contains_key(&va) {
            return false;
        }
        self.pages.insert(va, UserPage { frame, writable });
        true
    }

    /// Remove the mapping at `va`, releasing its frame.
    pub fn unmap(&mut self, va: u64) -> bool {
        self.pages.remove(&va).is_some()
    }

    /// True if the page containing `va` is mapped.
    pub fn is_mapped(&self, va: u64) -> bool {
        self.pages.contains_key(&page_round_down(va))
    }

    /// Number of mapped pages.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Read one byte of user memory. None is the captured page fault:
    /// the page is not mapped (or the address is not a user address).
    pub fn read_byte(&self, va: u64) -> Option<u8> {
        if !is_user_vaddr(va) {
            return None;
        }
        let page = self.pages.get(&page_round_down(va))?;
        Some(page.frame.bytes()[page_offset(va)])
    }

    /// Write one byte of user memory; false on fault (unmapped page or
    /// read-only mapping).
    pub fn write_byte(&mut self, va: u64, value: u8) -> bool {
        if !is_user_vaddr(va) {
            return false;
        }
        match self.pages.get_mut(&page_round_down(va)) {
            Some(page) if page.writable => {
                page.frame.bytes_mut()[page_offset(va)] = value;
                true
            }
            _ => false,
        }
    }

    /// Copy a range of user memory out; false on any fault.
    pub fn read_bytes(&self, va: u64, buf: &mut [u8]) -> bool {
        for (i, slot) in buf.iter_mut().enumerate() {
            match self.read_byte(va + i as u64) {
                Some(b) => *slot = b,
                None => return false,
            }
        }
        true
    }

    /// Copy a buffer into user memory; false on any fault.
    pub fn write_bytes(&mut self, va: u64, buf: &[u8]) -> bool {
        for (i, &b) in buf.iter().enumerate() {
            if !self.write_byte(va + i as u64, b) {
                return false;
            }
        }
        true
    }

    /// Read a NUL-terminated string from user memory.
    pub fn read_cstr(&self, va: u64, max: usize) -> Option<alloc::string::String> {
        let mut bytes = alloc::vec::Vec::new();
        for i in 0..max as u64 {
            let b = self.read_byte(va + i)?;
            if b == 0 {
                return alloc::string::String::from_utf8(bytes).ok();
            }
            bytes.push(b);
        }
        None
    }

    /// Clone every mapping for fork: read-only pages stay read-only,
    /// writable stay writable, contents are copied frame by frame.
    pub fn duplicate(&self) -> Result<AddressSpace, &'static str> {
        let mut child = AddressSpace::new().ok_or("page table allocation failed")?;
        for (&va, page) in &self.pages {
            let mut frame =
                palloc::alloc_page(AllocFlags::USER | AllocFlags::ZERO).ok_or("out of user pages")?;
            frame.bytes_mut().copy_from_slice(page.frame.bytes());
            if !child.map(va, frame, page.writable) {
                return Err("duplicate mapping in child");
            }
        }
        Ok(child)
    }

    /// Install this address space on the CPU.
    ///
    /// Called on every context switch into a thread owning this space;
    /// the kernel-only root is restored by destroy().
    pub fn activate(&self) {
        ACTIVE_ASID.store(self.asid, Ordering::SeqCst);
    }

    /// Tear down all mappings and fall back to the kernel-only root.
    ///
    /// The ordering matters: the root is switched away first so a timer
    /// interrupt cannot run on a page table that is being freed.
    pub fn destroy(&mut self) {
        ACTIVE_ASID
            .compare_exchange(self.asid, 0, Ordering::SeqCst, Ordering::SeqCst)
            .ok();
        self.pages.clear();
    }

    /// Page-aligned VAs of every mapping (fork copy, diagnostics).
    pub fn mapped_pages(&self) -> impl Iterator<Item = u64> + '_ {
        self.pages.keys().copied()
    }

    /// Writable bit of the page containing `va`.
    pub fn is_writable(&self, va: u64) -> Option<bool> {
        self.pages.get(&page_round_down(va)).map(|p| p.writable)
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl core::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("asid", &self.asid)
            .field("pages", &self.pages.len())
            .finish()
    }
}
