/*
 * Kernel Heap
 *
 * Backs the alloc crate (Box, Vec, BTreeMap) when running bare-metal.
 * Boot glue hands over one contiguous region; the linked-list allocator
 * manages it behind a spin mutex. Under the host test harness the host
 * allocator is used instead and this module is inert.
 */

#[cfg(not(test))]
use linked_list_allocator::LockedHeap;

#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Initialize the kernel heap over `[start, start + size)`.
///
/// # Safety
/// The region must be unused, writable RAM, and this must be called
/// exactly once before the first allocation.
#[cfg(not(test))]
pub unsafe fn init(start: *mut u8, size: usize) {
    unsafe {
        ALLOCATOR.lock().init(start, size);
    }
    log::info!("kernel heap: {} KiB at {:p}", size / 1024, start);
}

#[cfg(test)]
pub unsafe fn init(_start: *mut u8, _size: usize) {}
