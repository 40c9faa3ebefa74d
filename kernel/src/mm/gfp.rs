//! Physical and virtual page allocation.
//!
//! Physical memory is partitioned into *memory areas*, each with a base
//! physical address, an optional virtual base (when the area is directly
//! mapped), and a bit-per-page occupancy bitmap. Two areas exist: the kernel
//! image area (the loaded image plus the internal page pool, `GRINCH_SIZE`
//! big) and the direct-physical area covering all usable RAM.
//!
//! All allocator state sits behind one spinlock; allocations are bounded
//! scans of the bitmaps and never sleep.

use riscv::{
    paging::{FrameSource, PAGE_SIZE},
    PhysAddr, VirtAddr,
};
use spin::Mutex;

use crate::config::{DIR_PHYS_BASE, GRINCH_SIZE, VMGRINCH_BASE};
use crate::errno::{Errno, Result};
use crate::mm::bitmap;

const KMM_PAGES: usize = GRINCH_SIZE / PAGE_SIZE;
const KMM_WORDS: usize = bitmap::elems(KMM_PAGES);

/// Number of pages covering `size` bytes.
pub const fn pages(size: usize) -> usize {
    (size + PAGE_SIZE - 1) / PAGE_SIZE
}

enum Store {
    /// The kernel area's bitmap lives inline; it exists before any allocator.
    Inline([u64; KMM_WORDS]),
    /// Later areas keep their bitmap in pages taken from the kernel area.
    Slice(&'static mut [u64]),
}

impl Store {
    fn words(&mut self) -> &mut [u64] {
        match self {
            Store::Inline(words) => words,
            Store::Slice(words) => words,
        }
    }

    fn words_ref(&self) -> &[u64] {
        match self {
            Store::Inline(words) => words,
            Store::Slice(words) => words,
        }
    }
}

struct MemoryArea {
    bits: Store,
    bit_max: usize,
    p_base: u64,
    v_base: Option<usize>,
}

impl MemoryArea {
    fn p_end(&self) -> u64 {
        self.p_base + (self.bit_max * PAGE_SIZE) as u64
    }

    fn contains_v(&self, virt: usize, n: usize) -> bool {
        match self.v_base {
            Some(v_base) => {
                virt >= v_base && virt + n * PAGE_SIZE <= v_base + self.bit_max * PAGE_SIZE
            }
            None => false,
        }
    }

    fn contains_p(&self, phys: u64, n: usize) -> bool {
        phys >= self.p_base && phys + (n * PAGE_SIZE) as u64 <= self.p_end()
    }

    fn v2p(&self, virt: usize) -> u64 {
        self.p_base + (virt - self.v_base.unwrap()) as u64
    }

    fn p2v(&self, phys: u64) -> Option<usize> {
        self.v_base.map(|v| v + (phys - self.p_base) as usize)
    }

    /// Allocates `n` pages at a bit index honouring `align` (bytes), or at
    /// the exact position of `at` when given. Returns the page index.
    fn alloc(&mut self, n: usize, align: usize, at: Option<u64>) -> Result<usize> {
        match at {
            Some(phys) => {
                let start = ((phys - self.p_base) as usize) / PAGE_SIZE;
                if !bitmap::all_clear(self.bits.words(), start, n) {
                    return Err(Errno::EBUSY);
                }
                bitmap::set(self.bits.words(), start, n);
                Ok(start)
            }
            None => {
                let align_mask = align / PAGE_SIZE - 1;
                let start =
                    bitmap::find_next_zero_area(self.bits.words(), self.bit_max, 0, n, align_mask)
                        .ok_or(Errno::ENOMEM)?;
                bitmap::set(self.bits.words(), start, n);
                Ok(start)
            }
        }
    }

    fn free(&mut self, start: usize, n: usize) -> Result<()> {
        if start + n > self.bit_max {
            return Err(Errno::ERANGE);
        }
        bitmap::clear(self.bits.words(), start, n);
        Ok(())
    }
}

/// The allocator: up to two memory areas behind one lock.
struct Gfp {
    areas: [Option<MemoryArea>; 2],
}

impl Gfp {
    const fn new() -> Self {
        Gfp {
            areas: [None, None],
        }
    }

    fn areas_mut(&mut self) -> impl Iterator<Item = &mut MemoryArea> + '_ {
        self.areas.iter_mut().flatten()
    }

    fn areas_ref(&self) -> impl Iterator<Item = &MemoryArea> + '_ {
        self.areas.iter().flatten()
    }

    fn kernel_mem_init(&mut self, load_pa: u64, used_pages: usize) -> Result<()> {
        let mut area = MemoryArea {
            bits: Store::Inline([0; KMM_WORDS]),
            bit_max: KMM_PAGES,
            p_base: load_pa,
            v_base: Some(VMGRINCH_BASE),
        };

        // The loaded image occupies the start of the area.
        area.alloc(used_pages, PAGE_SIZE, Some(load_pa))?;

        self.areas[0] = Some(area);
        Ok(())
    }

    fn add_phys_area(
        &mut self,
        store: &'static mut [u64],
        base: u64,
        size: usize,
    ) -> Result<()> {
        let slot = self
            .areas
            .iter_mut()
            .find(|a| a.is_none())
            .ok_or(Errno::ENOENT)?;

        *slot = Some(MemoryArea {
            bit_max: pages(size),
            bits: Store::Slice(store),
            p_base: base,
            v_base: Some(DIR_PHYS_BASE),
        });

        // The kernel image is physically inside this region; keep its pages
        // out of reach.
        let kernel = self.areas[0].as_ref().map(|a| (a.p_base, a.bit_max));
        if let (Some((kernel_pa, kernel_pages)), Some(area)) = (kernel, self.areas[1].as_mut()) {
            if area.contains_p(kernel_pa, kernel_pages) {
                area.alloc(kernel_pages, PAGE_SIZE, Some(kernel_pa))?;
            }
        }

        Ok(())
    }

    fn phys_alloc(&mut self, n: usize, align: usize) -> Result<u64> {
        for area in self.areas_mut() {
            if let Ok(start) = area.alloc(n, align, None) {
                return Ok(area.p_base + (start * PAGE_SIZE) as u64);
            }
        }
        Err(Errno::ENOMEM)
    }

    fn phys_mark_used(&mut self, phys: u64, n: usize) -> Result<()> {
        for area in self.areas_mut() {
            if area.contains_p(phys, n) {
                area.alloc(n, PAGE_SIZE, Some(phys))?;
                return Ok(());
            }
        }
        Err(Errno::ERANGE)
    }

    fn phys_free(&mut self, phys: u64, n: usize) -> Result<()> {
        if phys & (PAGE_SIZE as u64 - 1) != 0 {
            return Err(Errno::EINVAL);
        }
        for area in self.areas_mut() {
            if area.contains_p(phys, n) {
                let start = ((phys - area.p_base) as usize) / PAGE_SIZE;
                return area.free(start, n);
            }
        }
        Err(Errno::ERANGE)
    }

    fn virt_alloc(&mut self, n: usize, align: usize) -> Result<usize> {
        for area in self.areas_mut() {
            if area.v_base.is_none() {
                continue;
            }
            if let Ok(start) = area.alloc(n, align, None) {
                return Ok(area.v_base.unwrap() + start * PAGE_SIZE);
            }
        }
        Err(Errno::ENOMEM)
    }

    fn virt_free(&mut self, virt: usize, n: usize) -> Result<()> {
        if virt & (PAGE_SIZE - 1) != 0 {
            return Err(Errno::EINVAL);
        }
        for area in self.areas_mut() {
            if area.contains_v(virt, n) {
                let start = (virt - area.v_base.unwrap()) / PAGE_SIZE;
                return area.free(start, n);
            }
        }
        Err(Errno::ENOENT)
    }

    fn v2p(&self, virt: usize) -> Option<u64> {
        self.areas_ref()
            .find(|a| a.contains_v(virt, 0))
            .map(|a| a.v2p(virt))
    }

    fn p2v(&self, phys: u64) -> Option<usize> {
        self.areas_ref()
            .find(|a| a.contains_p(phys, 0) && a.v_base.is_some())
            .and_then(|a| a.p2v(phys))
    }

    fn free_page_count(&self) -> usize {
        self.areas_ref()
            .map(|a| {
                (0..a.bit_max)
                    .filter(|&i| bitmap::all_clear(a.bits.words_ref(), i, 1))
                    .count()
            })
            .sum()
    }
}

static GFP: Mutex<Gfp> = Mutex::new(Gfp::new());

/// Sets up the kernel image area. `load_pa` is the physical load address,
/// `used_pages` the page count of the loaded image (rest becomes the
/// internal page pool).
pub fn kernel_mem_init(load_pa: PhysAddr, used_pages: usize) -> Result<()> {
    pr_info!(
        "gfp: kernel area {} pages, {} in image",
        KMM_PAGES,
        used_pages
    );
    GFP.lock().kernel_mem_init(load_pa.data(), used_pages)
}

/// Registers main memory `[base, base + size)` as the direct-physical area.
///
/// The caller must already have the direct map installed. The bitmap backing
/// is taken from the kernel area.
pub fn phys_mem_init(base: PhysAddr, size: usize) -> Result<()> {
    let words = bitmap::elems(pages(size));
    let store_va = zalloc_pages(pages(words * 8))?;
    // SAFETY: freshly allocated, zeroed, never released
    let store = unsafe { core::slice::from_raw_parts_mut(store_va.as_mut_ptr::<u64>(), words) };

    pr_info!("gfp: main memory {} ({:#x} bytes)", base, size);
    GFP.lock().add_phys_area(store, base.data(), size)
}

/// Allocates `n` contiguous physical pages with the given byte alignment.
pub fn phys_pages_alloc_aligned(n: usize, align: usize) -> Result<PhysAddr> {
    GFP.lock().phys_alloc(n, align).map(PhysAddr::new)
}

/// Marks `[phys, phys + n pages)` as allocated. Fails with `EBUSY` if any
/// page in the range is already in use.
pub fn phys_mark_used(phys: PhysAddr, n: usize) -> Result<()> {
    GFP.lock().phys_mark_used(phys.data(), n)
}

/// Releases `n` physical pages starting at `phys`.
pub fn phys_free_pages(phys: PhysAddr, n: usize) -> Result<()> {
    GFP.lock().phys_free(phys.data(), n)
}

/// Allocates `n` directly-mapped pages and returns their virtual address.
pub fn alloc_pages_aligned(n: usize, align: usize) -> Result<VirtAddr> {
    GFP.lock().virt_alloc(n, align).map(VirtAddr::new)
}

/// Allocates `n` directly-mapped pages.
pub fn alloc_pages(n: usize) -> Result<VirtAddr> {
    alloc_pages_aligned(n, PAGE_SIZE)
}

/// Allocates and zeroes `n` directly-mapped pages.
pub fn zalloc_pages_aligned(n: usize, align: usize) -> Result<VirtAddr> {
    let va = alloc_pages_aligned(n, align)?;
    // SAFETY: the pages were just allocated and are mapped
    unsafe { core::ptr::write_bytes(va.as_mut_ptr::<u8>(), 0, n * PAGE_SIZE) };
    Ok(va)
}

/// Allocates and zeroes `n` directly-mapped pages.
pub fn zalloc_pages(n: usize) -> Result<VirtAddr> {
    zalloc_pages_aligned(n, PAGE_SIZE)
}

/// Releases pages previously obtained from [`alloc_pages_aligned`].
pub fn free_pages(va: VirtAddr, n: usize) -> Result<()> {
    GFP.lock().virt_free(va.data(), n)
}

/// Translates a directly-mapped virtual address to its physical address.
///
/// Panics when `va` belongs to no memory area; such a translation request is
/// a kernel bug.
pub fn v2p(va: VirtAddr) -> PhysAddr {
    match GFP.lock().v2p(va.data()) {
        Some(pa) => PhysAddr::new(pa),
        None => panic!("gfp: unable to resolve address {}", va),
    }
}

/// Translates a physical address into the direct map.
///
/// Panics when `pa` belongs to no directly-mapped area.
pub fn p2v(pa: PhysAddr) -> VirtAddr {
    match GFP.lock().p2v(pa.data()) {
        Some(va) => VirtAddr::new(va),
        None => panic!("gfp: invalid phys address {}", pa),
    }
}

/// Number of currently free pages across all areas.
pub fn free_page_count() -> usize {
    GFP.lock().free_page_count()
}

/// Frame source feeding the page-table walker from the page allocator.
pub struct GfpFrames;

impl FrameSource for GfpFrames {
    fn alloc_table(&mut self) -> Option<PhysAddr> {
        zalloc_pages(1).ok().map(v2p)
    }

    fn free_table(&mut self, pa: PhysAddr) {
        let _ = phys_free_pages(pa, 1);
    }

    fn phys_to_ptr(&self, pa: PhysAddr) -> *mut u8 {
        p2v(pa).as_mut_ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_gfp() -> Gfp {
        let mut gfp = Gfp::new();
        gfp.kernel_mem_init(0x8020_0000, 64).unwrap();

        let store = alloc::vec![0u64; bitmap::elems(pages(64 * 1024 * 1024))].leak();
        gfp.add_phys_area(store, 0x8000_0000, 64 * 1024 * 1024)
            .unwrap();
        gfp
    }

    #[test]
    fn allocations_are_disjoint() {
        let mut gfp = test_gfp();

        let mut got = alloc::vec::Vec::new();
        for _ in 0..32 {
            let pa = gfp.phys_alloc(4, PAGE_SIZE).unwrap();
            for prev in &got {
                let (a, b): (u64, u64) = (*prev, pa);
                assert!(a + (4 * PAGE_SIZE) as u64 <= b || b + (4 * PAGE_SIZE) as u64 <= a);
            }
            got.push(pa);
        }
    }

    #[test]
    fn kernel_image_is_reserved() {
        let mut gfp = test_gfp();

        // The whole kernel area is carved out of the phys area.
        assert!(gfp.phys_mark_used(0x8020_0000, 1).is_err());
        assert!(gfp
            .phys_mark_used(0x8020_0000 + GRINCH_SIZE as u64 - PAGE_SIZE as u64, 1)
            .is_err());
        assert!(gfp.phys_mark_used(0x8000_0000, 16).is_ok());
    }

    #[test]
    fn mark_used_rejects_overlap() {
        let mut gfp = test_gfp();

        gfp.phys_mark_used(0x8100_0000, 8).unwrap();
        assert_eq!(gfp.phys_mark_used(0x8100_4000, 8), Err(Errno::EBUSY));
        assert_eq!(gfp.phys_mark_used(0x8100_0000, 1), Err(Errno::EBUSY));
        gfp.phys_free(0x8100_0000, 8).unwrap();
        gfp.phys_mark_used(0x8100_4000, 8).unwrap();
    }

    #[test]
    fn alignment_is_honoured() {
        let mut gfp = test_gfp();

        let _ = gfp.phys_alloc(1, PAGE_SIZE).unwrap();
        let pa = gfp.phys_alloc(1, 2 * 1024 * 1024).unwrap();
        assert_eq!(pa % (2 * 1024 * 1024), 0);
    }

    #[test]
    fn virt_alloc_translates_both_ways() {
        let mut gfp = test_gfp();

        let va = gfp.virt_alloc(2, PAGE_SIZE).unwrap();
        let pa = gfp.v2p(va).unwrap();
        assert_eq!(gfp.p2v(pa), Some(va));

        gfp.virt_free(va, 2).unwrap();
        assert!(gfp.virt_free(va + 1, 1).is_err());
    }

    #[test]
    fn exhaustion_reports_oom() {
        let mut gfp = Gfp::new();
        gfp.kernel_mem_init(0x8020_0000, KMM_PAGES - 4).unwrap();

        assert!(gfp.phys_alloc(4, PAGE_SIZE).is_ok());
        assert_eq!(gfp.phys_alloc(1, PAGE_SIZE), Err(Errno::ENOMEM));
    }
}
