//! Device MMIO mapping.
//!
//! A fixed virtual window is handed out page-wise, tracked by a bitmap.
//! Placement aims for natural alignment: a region of size 2^k lands on a
//! 2^k-aligned virtual address whenever its physical alignment permits, so
//! device registers keep their low address bits.
//!
//! Remapping happens during boot and driver probe only; a region must be
//! released by exactly one [`iounmap`] matching the original size.

use riscv::paging::{MemFlags, PAGE_SIZE};
use riscv::{PhysAddr, VirtAddr};
use spin::Mutex;

use crate::arch;
use crate::config::{IOREMAP_BASE, IOREMAP_END, IOREMAP_SIZE};
use crate::errno::{Errno, Result};
use crate::mm::{bitmap, gfp, paging};

const IOREMAP_PAGES: usize = IOREMAP_SIZE / PAGE_SIZE;

static IOREMAP_BITMAP: Mutex<[u64; bitmap::elems(IOREMAP_PAGES)]> =
    Mutex::new([0; bitmap::elems(IOREMAP_PAGES)]);

/// Maps `[paddr, paddr + size)` as uncached device memory and returns the
/// virtual address of `paddr` within the window.
pub fn ioremap(paddr: PhysAddr, size: usize) -> Result<VirtAddr> {
    let size = gfp::pages(size) * PAGE_SIZE;
    let n = size / PAGE_SIZE;

    // Choose the window alignment from size and physical alignment
    let paddr_al = paddr.data().trailing_zeros();
    let size_al = (size as u64).trailing_zeros();
    let align_mask = if size_al <= paddr_al {
        gfp::pages(1 << size_al) - 1
    } else {
        0
    };

    let mut map = IOREMAP_BITMAP.lock();
    let start = bitmap::find_next_zero_area(&*map, IOREMAP_PAGES, 0, n, align_mask)
        .ok_or(Errno::ENOMEM)?;

    let va = VirtAddr::new(IOREMAP_BASE + start * PAGE_SIZE);
    paging::map_range(
        va,
        paddr.align_down(PAGE_SIZE as u64),
        size,
        MemFlags::DEVICE | MemFlags::RW,
    )?;
    arch::flush_tlb_local();

    bitmap::set(&mut *map, start, n);

    Ok(va + paddr.page_offset() as usize)
}

/// Releases a region previously mapped with [`ioremap`].
pub fn iounmap(vaddr: VirtAddr, size: usize) -> Result<()> {
    let size = gfp::pages(size) * PAGE_SIZE;
    let n = size / PAGE_SIZE;
    let vaddr = vaddr.align_down(PAGE_SIZE as u64);

    if vaddr.data() < IOREMAP_BASE || vaddr.data() + size > IOREMAP_END {
        return Err(Errno::ERANGE);
    }

    paging::unmap_range(vaddr, size)?;
    arch::flush_tlb_local();

    let start = (vaddr.data() - IOREMAP_BASE) / PAGE_SIZE;
    bitmap::clear(&mut *IOREMAP_BITMAP.lock(), start, n);

    Ok(())
}
