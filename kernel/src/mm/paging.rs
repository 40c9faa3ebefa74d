//! Kernel bindings of the page-table walker.
//!
//! The walker in the `riscv` crate is pure; this module supplies it with
//! frames from the page allocator, tracks the boot-selected paging modes,
//! and takes care of TLB maintenance on the local CPU. Cross-CPU shootdown
//! for shared kernel mappings is the caller's business (`flush_tlb_all`).

use riscv::paging::{self, MemFlags, Paging, PAGE_SIZE, SV39, SV39X4};
use riscv::{PhysAddr, VirtAddr};

use crate::arch;
use crate::config::{DIR_PHYS_BASE, USER_END, VMGRINCH_BASE};
use crate::errno::{Errno, Result};
use crate::mm::gfp::{self, GfpFrames};
use crate::percpu::this_per_cpu;

/// Modified-VA counts above this threshold flush the whole local TLB
/// instead of single entries.
const FLUSH_ALL_THRESHOLD: usize = 64;

/// The paging mode of kernel and process address spaces.
pub fn host_paging() -> &'static Paging {
    &SV39
}

/// The paging mode of guest (G-stage) address spaces.
pub fn vm_paging() -> &'static Paging {
    &SV39X4
}

/// Number of root entries covering the user half of an address space.
pub fn user_root_entries() -> usize {
    USER_END >> host_paging().root_shift()
}

fn flush_range(va: VirtAddr, size: usize) {
    if size / PAGE_SIZE > FLUSH_ALL_THRESHOLD {
        arch::flush_tlb_local();
        return;
    }

    let mut addr = va.align_down(PAGE_SIZE as u64);
    let end = (va + size).align_up(PAGE_SIZE as u64);
    while addr < end {
        arch::flush_tlb_page(addr);
        addr += PAGE_SIZE;
    }
}

fn map_err(_: paging::PagingError) -> Errno {
    Errno::ENOMEM
}

/// Maps `[vaddr, vaddr + size)` to `[paddr, ...)` in the given root table.
pub fn map_range_on(
    root: PhysAddr,
    vaddr: VirtAddr,
    paddr: PhysAddr,
    size: usize,
    flags: MemFlags,
) -> Result<()> {
    paging::map_range(&mut GfpFrames, host_paging(), root, vaddr, paddr, size, flags)
        .map_err(map_err)?;
    flush_range(vaddr, size);
    Ok(())
}

/// Removes `[vaddr, vaddr + size)` from the given root table.
pub fn unmap_range_on(root: PhysAddr, vaddr: VirtAddr, size: usize) -> Result<()> {
    paging::unmap_range(&mut GfpFrames, host_paging(), root, vaddr, size).map_err(map_err)?;
    flush_range(vaddr, size);
    Ok(())
}

/// Maps a range into this CPU's root table.
pub fn map_range(vaddr: VirtAddr, paddr: PhysAddr, size: usize, flags: MemFlags) -> Result<()> {
    map_range_on(this_per_cpu().root_table_pa(), vaddr, paddr, size, flags)
}

/// Unmaps a range from this CPU's root table.
pub fn unmap_range(vaddr: VirtAddr, size: usize) -> Result<()> {
    unmap_range_on(this_per_cpu().root_table_pa(), vaddr, size)
}

/// Resolves a virtual address through an arbitrary root table.
pub fn get_phys_on(root: PhysAddr, vaddr: VirtAddr) -> Option<PhysAddr> {
    paging::virt_to_phys(&GfpFrames, host_paging(), root, vaddr)
}

/// Maps a guest-physical range in a G-stage table.
pub fn vm_map_range(
    root: PhysAddr,
    gphys: VirtAddr,
    paddr: PhysAddr,
    size: usize,
    flags: MemFlags,
) -> Result<()> {
    paging::map_range(&mut GfpFrames, vm_paging(), root, gphys, paddr, size, flags)
        .map_err(map_err)
}

/// Removes a guest-physical range from a G-stage table.
pub fn vm_unmap_range(root: PhysAddr, gphys: VirtAddr, size: usize) -> Result<()> {
    paging::unmap_range(&mut GfpFrames, vm_paging(), root, gphys, size).map_err(map_err)
}

/// Copies the kernel half of `from`'s root table into `to`. Both roots then
/// share all kernel mappings by construction.
pub fn share_kernel_half(to: PhysAddr, from: PhysAddr) {
    let mode = host_paging();
    paging::copy_root_range(
        &GfpFrames,
        mode,
        to,
        from,
        mode.root_entries() / 2..mode.root_entries(),
    );
}

/// Builds this CPU's kernel address space and switches to it.
///
/// Maps the kernel image sections with their proper permissions and returns
/// with translation running on the new root table.
pub fn init() -> Result<()> {
    let tpcpu = this_per_cpu();
    let root = tpcpu.root_table_pa();
    let load = arch::load_pa();

    let image_pa = |va: VirtAddr| load + (va.data() - VMGRINCH_BASE) as u64;

    let (init_va, init_size) = arch::section_init();
    map_range_on(root, init_va, image_pa(init_va), init_size, MemFlags::RX)?;

    let (text_va, text_size) = arch::section_text();
    map_range_on(root, text_va, image_pa(text_va), text_size, MemFlags::RX)?;

    let (ro_va, ro_size) = arch::section_rodata();
    map_range_on(root, ro_va, image_pa(ro_va), ro_size, MemFlags::READ)?;

    let (rw_va, rw_size) = arch::section_rw_data();
    map_range_on(root, rw_va, image_pa(rw_va), rw_size, MemFlags::RW)?;

    // The internal page pool behind the image
    let pool_va = VirtAddr::new(VMGRINCH_BASE + arch::kernel_image_pages() * PAGE_SIZE);
    let pool_size = crate::config::GRINCH_SIZE - arch::kernel_image_pages() * PAGE_SIZE;
    map_range_on(root, pool_va, image_pa(pool_va), pool_size, MemFlags::RW)?;

    pr_info!("=== grinch memory layout ===");
    pr_info!(
        " grinch area: {:#x} -- {:#x}",
        VMGRINCH_BASE,
        crate::config::VMGRINCH_END
    );
    pr_info!(
        "ioremap area: {:#x} -- {:#x}",
        crate::config::IOREMAP_BASE,
        crate::config::IOREMAP_END
    );
    pr_info!("  kheap area: {:#x}", crate::config::KHEAP_BASE);
    pr_info!(" direct phys: {:#x}", DIR_PHYS_BASE);
    pr_info!("=== grinch memory layout end ===");

    // SAFETY: the new root maps the running kernel
    unsafe { arch::enable_paging(root) };

    Ok(())
}

/// Installs the direct physical map over `[base, base + size)`.
pub fn init_direct_map(base: PhysAddr, size: usize) -> Result<()> {
    map_range(VirtAddr::new(DIR_PHYS_BASE), base, size, MemFlags::RW)
}

/// Releases the boot-only `.init` sections back to the page allocator.
pub fn discard_init() -> Result<()> {
    let (va, size) = arch::section_init();
    if size == 0 {
        return Ok(());
    }

    pr_info!("freeing {:#x} bytes of init code", size);

    let load = arch::load_pa();
    let pa = load + (va.data() - VMGRINCH_BASE) as u64;

    // Downgrade to plain data, then hand the pages to the allocator
    map_range(va, pa, size, MemFlags::RW)?;
    arch::flush_tlb_all();

    gfp::free_pages(va, gfp::pages(size))
}
