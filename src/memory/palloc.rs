/*
 * Page Allocator
 *
 * Page-granular allocation for kernel stacks, user frames and fd-table
 * storage. Pages are 4 KiB, aligned, and zeroed. Single pages and
 * contiguous multi-page runs come out of the same global budget, so
 * allocation failure is a real, propagated condition instead of a heap
 * abort; the boot glue sizes the budget to the machine.
 *
 * Release is by ownership: dropping a Page/Pages returns its slots to
 * the budget. The explicit free functions exist for call sites where a
 * bare `drop(page)` would read as an accident rather than a release.
 */

use alloc::boxed::Box;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Page size in bytes.
pub const PAGE_SIZE: usize = 4096;

bitflags! {
    /// Allocation hints.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Page will be mapped into a user address space.
        const USER = 1 << 0;
        /// Zero the page before returning it.
        const ZERO = 1 << 1;
    }
}

/// Pages remaining in the global budget.
static PAGES_LEFT: AtomicUsize = AtomicUsize::new(usize::MAX);

/// Take `count` slots from a budget counter; false when fewer remain.
/// All-or-nothing, so a large request cannot strand a partial reserve.
fn reserve_slots(counter: &AtomicUsize, count: usize) -> bool {
    let mut left = counter.load(Ordering::SeqCst);
    loop {
        if left < count {
            return false;
        }
        match counter.compare_exchange(left, left - count, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return true,
            Err(actual) => left = actual,
        }
    }
}

fn release_slots(counter: &AtomicUsize, count: usize) {
    counter.fetch_add(count, Ordering::SeqCst);
}

#[repr(C, align(4096))]
struct PageBuf([u8; PAGE_SIZE]);

/// An owned, page-aligned 4 KiB page. Its budget slot is released on
/// drop.
pub struct Page {
    buf: Box<PageBuf>,
}

impl Page {
    pub fn bytes(&self) -> &[u8] {
        &self.buf.0
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf.0
    }

    /// Base address of the page (for stack-top computation).
    pub fn base_addr(&self) -> usize {
        self.buf.0.as_ptr() as usize
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        release_slots(&PAGES_LEFT, 1);
    }
}

impl core::fmt::Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Page({:#x})", self.base_addr())
    }
}

/// An owned, contiguous run of pages (page-table storage, fd tables -
/// anything addressed as one block). All slots go back to the budget on
/// drop.
pub struct Pages {
    buf: Box<[PageBuf]>,
}

impl Pages {
    /// Number of pages in the run.
    pub fn count(&self) -> usize {
        self.buf.len()
    }

    /// Base address of the run; page i starts at base + i * PAGE_SIZE.
    pub fn base_addr(&self) -> usize {
        self.buf.as_ptr() as usize
    }

    pub fn page_bytes(&self, index: usize) -> &[u8] {
        &self.buf[index].0
    }

    pub fn page_bytes_mut(&mut self, index: usize) -> &mut [u8] {
        &mut self.buf[index].0
    }
}

impl Drop for Pages {
    fn drop(&mut self) {
        release_slots(&PAGES_LEFT, self.buf.len());
    }
}

impl core::fmt::Debug for Pages {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pages({:#x}, {})", self.base_addr(), self.count())
    }
}

/// Cap the number of simultaneously live pages. Called once by boot
/// glue, before any allocation.
pub fn set_page_budget(pages: usize) {
    PAGES_LEFT.store(pages, Ordering::SeqCst);
}

/// Allocate one page, or None if the budget is exhausted.
pub fn alloc_page(flags: AllocFlags) -> Option<Page> {
    if !reserve_slots(&PAGES_LEFT, 1) {
        return None;
    }
    let _ = flags; // pages come from the zeroed pool either way
    Some(Page {
        buf: Box::new(PageBuf([0u8; PAGE_SIZE])),
    })
}

/// Allocate `count` contiguous pages, or None if the request is empty
/// or more pages than the budget has left.
pub fn alloc_pages(flags: AllocFlags, count: usize) -> Option<Pages> {
    if count == 0 || !reserve_slots(&PAGES_LEFT, count) {
        return None;
    }
    let _ = flags;
    let buf: Vec<PageBuf> = (0..count).map(|_| PageBuf([0u8; PAGE_SIZE])).collect();
    Some(Pages {
        buf: buf.into_boxed_slice(),
    })
}

/// Release one page back to the pool.
pub fn free_page(page: Page) {
    drop(page);
}

/// Release a page run back to the pool.
pub fn free_pages(pages: Pages) {
    drop(pages);
}

/// Pages currently available.
pub fn pages_left() -> usize {
    PAGES_LEFT.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_is_aligned_and_zeroed() {
        let page = alloc_page(AllocFlags::ZERO).unwrap();
        assert_eq!(page.base_addr() % PAGE_SIZE, 0);
        assert!(page.bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_multi_page_run_is_contiguous_and_aligned() {
        let mut run = alloc_pages(AllocFlags::USER | AllocFlags::ZERO, 3).unwrap();
        assert_eq!(run.count(), 3);
        assert_eq!(run.base_addr() % PAGE_SIZE, 0);
        for i in 0..3 {
            assert_eq!(
                run.page_bytes(i).as_ptr() as usize,
                run.base_addr() + i * PAGE_SIZE
            );
        }
        run.page_bytes_mut(2)[0] = 0xEE;
        assert_eq!(run.page_bytes(2)[0], 0xEE);
        assert!(run.page_bytes(0).iter().all(|&b| b == 0));

        assert!(alloc_pages(AllocFlags::USER, 0).is_none());
        free_pages(run);
    }

    #[test]
    fn test_budget_counter_exhausts_and_reclaims() {
        let counter = AtomicUsize::new(3);
        assert!(reserve_slots(&counter, 2));
        // A multi-page request never partially drains the counter.
        assert!(!reserve_slots(&counter, 2));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(reserve_slots(&counter, 1));
        assert!(!reserve_slots(&counter, 1));

        release_slots(&counter, 3);
        assert!(reserve_slots(&counter, 3));
    }
}
