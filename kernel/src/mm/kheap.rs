//! Kernel heap.
//!
//! Every `Box`, `Vec` and `Arc` in the kernel comes from this allocator. It
//! is backed by physically contiguous pages mapped at `KHEAP_BASE`, sized
//! by the `kheap_size=` boot parameter. `malloc_fsck` arms a cheap
//! consistency check on every allocation.

use core::alloc::{GlobalAlloc, Layout};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use linked_list_allocator::LockedHeap;
use riscv::paging::{MemFlags, MEGA_PAGE_SIZE};
use riscv::VirtAddr;

use crate::bootparam;
use crate::config::{DIR_PHYS_BASE, KHEAP_BASE, KHEAP_DEFAULT_SIZE};
use crate::errno::Result;
use crate::mm::{gfp, paging};

static KHEAP_SIZE: AtomicUsize = AtomicUsize::new(KHEAP_DEFAULT_SIZE);
static MALLOC_FSCK: AtomicBool = AtomicBool::new(false);

struct Kheap(LockedHeap);

#[cfg_attr(not(test), global_allocator)]
static KHEAP: Kheap = Kheap(LockedHeap::empty());

// SAFETY: forwards to LockedHeap, adding only statistics checks
unsafe impl GlobalAlloc for Kheap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        fsck();
        self.0.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        fsck();
        self.0.dealloc(ptr, layout)
    }
}

fn fsck() {
    if !MALLOC_FSCK.load(Ordering::Relaxed) {
        return;
    }

    let heap = KHEAP.0.lock();
    let total = heap.size();
    if heap.used() + heap.free() != total {
        panic!(
            "kheap: inconsistent accounting: {} used + {} free != {} total",
            heap.used(),
            heap.free(),
            total
        );
    }
}

pub(crate) fn parse_kheap_size(arg: Option<&str>) {
    if let Some(size) = arg.and_then(bootparam::parse_size) {
        KHEAP_SIZE.store(size, Ordering::Relaxed);
    }
}

pub(crate) fn parse_malloc_fsck(_arg: Option<&str>) {
    MALLOC_FSCK.store(true, Ordering::Relaxed);
}

/// Allocates and maps the heap arena, then brings up the allocator.
pub fn init() -> Result<()> {
    // The window between the remap area and the direct map bounds the heap
    let max = DIR_PHYS_BASE - KHEAP_BASE;
    let size = KHEAP_SIZE.load(Ordering::Relaxed).min(max);

    let phys = gfp::phys_pages_alloc_aligned(gfp::pages(size), MEGA_PAGE_SIZE)?;
    paging::map_range(VirtAddr::new(KHEAP_BASE), phys, size, MemFlags::RW)?;

    pr_info!("kheap: {} KiB at {:#x}", size / 1024, KHEAP_BASE);

    // SAFETY: the range was just mapped and is exclusively the heap's
    unsafe { KHEAP.0.lock().init(KHEAP_BASE as *mut u8, size) };

    Ok(())
}

/// Heap usage statistics: `(used, free)` bytes.
pub fn stats() -> (usize, usize) {
    let heap = KHEAP.0.lock();
    (heap.used(), heap.free())
}
