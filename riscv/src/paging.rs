//! Multi-level page-table construction and destruction.
//!
//! The walker is parameterized over a table of per-level descriptors, so the
//! same code services regular Sv39/Sv48 address spaces and the widened
//! Sv39x4/Sv48x4 G-stage tables used for guest-physical translation. Page
//! tables are built through a [`FrameSource`], which supplies zeroed table
//! pages and translates table addresses into dereferencable pointers; this
//! keeps the walker independent of the kernel's physical allocator.
//!
//! Hugepages are used greedily on [`map_range`] whenever size and alignment
//! permit. [`unmap_range`] splits hugepages that are only partially covered
//! by the region being removed and releases intermediate tables that become
//! empty. TLB maintenance is the caller's responsibility.

use bitflags::bitflags;

use crate::addr::{PhysAddr, VirtAddr};

/// Number of bits that an address needs to be shifted to obtain its page number.
pub const PAGE_SHIFT: usize = 12;

/// Size of a base page in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Size of a level-1 hugepage in bytes.
pub const MEGA_PAGE_SIZE: usize = PAGE_SIZE << 9;

/// Size of a level-2 hugepage in bytes.
pub const GIGA_PAGE_SIZE: usize = MEGA_PAGE_SIZE << 9;

const PTE_PPN_OFFSET: u64 = 10;

bitflags! {
    /// Caller-visible memory access attributes.
    pub struct MemFlags: u64 {
        /// Readable memory.
        const READ = 1 << 0;
        /// Writable memory.
        const WRITE = 1 << 1;
        /// Executable memory.
        const EXEC = 1 << 2;
        /// Accessible from U-mode (or guest mode for G-stage tables).
        const USER = 1 << 3;
        /// Non-cacheable device memory.
        const DEVICE = 1 << 4;

        /// Read-write memory.
        const RW = Self::READ.bits | Self::WRITE.bits;
        /// Read-exec memory.
        const RX = Self::READ.bits | Self::EXEC.bits;
        /// Read-write-exec memory accessible by a guest.
        const RWXU = Self::RW.bits | Self::EXEC.bits | Self::USER.bits;
    }
}

bitflags! {
    /// Bitfields of a page table entry. Managed internally; callers only ever
    /// see [`MemFlags`].
    struct EntryFlags: u64 {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXEC = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESS = 1 << 6;
        const DIRTY = 1 << 7;

        const LEAF = Self::READ.bits | Self::WRITE.bits | Self::EXEC.bits;
    }
}

/// Svpbmt page-based memory type: non-cacheable, non-idempotent I/O memory.
const PBMT_IO: u64 = 2 << 61;

/// Errors reported by page table operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingError {
    /// The frame source ran out of table pages.
    OutOfMemory,
}

/// Source of page-table frames and table-address translation.
///
/// The kernel backs this with its physical page allocator and the direct
/// physical map; tests back it with a plain arena.
pub trait FrameSource {
    /// Allocates one zeroed page for use as a page table.
    fn alloc_table(&mut self) -> Option<PhysAddr>;

    /// Releases a table page previously obtained from [`Self::alloc_table`].
    fn free_table(&mut self, pa: PhysAddr);

    /// Translates a physical address into a dereferencable pointer.
    ///
    /// Must be valid for any address within a page owned by the walker.
    fn phys_to_ptr(&self, pa: PhysAddr) -> *mut u8;
}

/// Descriptor of one translation level.
#[derive(Debug, Clone, Copy)]
pub struct Level {
    /// Size of a terminal mapping installed at this level.
    pub page_size: u64,
    /// Shift extracting this level's index from a virtual address.
    pub shift: u32,
    /// Number of entries in a table at this level.
    pub entries: usize,
}

const fn lvl(page_size: u64, shift: u32, entries: usize) -> Level {
    Level {
        page_size,
        shift,
        entries,
    }
}

/// A paging mode: the ordered list of levels from the root down to the leaf.
#[derive(Debug, Clone, Copy)]
pub struct Paging {
    levels: &'static [Level],
}

/// Sv39 translation: 3 levels, 512-entry tables.
pub static SV39: Paging = Paging {
    levels: &[
        lvl(GIGA_PAGE_SIZE as u64, 30, 512),
        lvl(MEGA_PAGE_SIZE as u64, 21, 512),
        lvl(PAGE_SIZE as u64, 12, 512),
    ],
};

/// Sv48 translation: 4 levels, 512-entry tables.
pub static SV48: Paging = Paging {
    levels: &[
        lvl((GIGA_PAGE_SIZE as u64) << 9, 39, 512),
        lvl(GIGA_PAGE_SIZE as u64, 30, 512),
        lvl(MEGA_PAGE_SIZE as u64, 21, 512),
        lvl(PAGE_SIZE as u64, 12, 512),
    ],
};

/// Sv39x4 G-stage translation: widened 2048-entry root spanning four pages.
pub static SV39X4: Paging = Paging {
    levels: &[
        lvl(GIGA_PAGE_SIZE as u64, 30, 2048),
        lvl(MEGA_PAGE_SIZE as u64, 21, 512),
        lvl(PAGE_SIZE as u64, 12, 512),
    ],
};

/// Sv48x4 G-stage translation: widened 2048-entry root spanning four pages.
pub static SV48X4: Paging = Paging {
    levels: &[
        lvl((GIGA_PAGE_SIZE as u64) << 9, 39, 2048),
        lvl(GIGA_PAGE_SIZE as u64, 30, 512),
        lvl(MEGA_PAGE_SIZE as u64, 21, 512),
        lvl(PAGE_SIZE as u64, 12, 512),
    ],
};

impl Paging {
    /// Number of contiguous, naturally aligned pages the root table occupies.
    pub const fn root_pages(&self) -> usize {
        self.levels[0].entries * 8 / PAGE_SIZE
    }

    /// Number of entries in the root table.
    pub const fn root_entries(&self) -> usize {
        self.levels[0].entries
    }

    /// Index shift of the root level.
    pub const fn root_shift(&self) -> u32 {
        self.levels[0].shift
    }
}

impl Level {
    fn index(&self, virt: u64) -> usize {
        ((virt >> self.shift) as usize) & (self.entries - 1)
    }
}

fn entry_ptr<S: FrameSource>(src: &S, table: PhysAddr, level: &Level, virt: u64) -> *mut u64 {
    src.phys_to_ptr(table + (level.index(virt) * 8) as u64) as *mut u64
}

fn entry_valid(pte: u64) -> bool {
    pte & EntryFlags::VALID.bits() != 0
}

fn entry_is_leaf(pte: u64) -> bool {
    entry_valid(pte) && (pte & EntryFlags::LEAF.bits()) != 0
}

fn entry_next_pt(pte: u64) -> PhysAddr {
    PhysAddr::new(((pte >> PTE_PPN_OFFSET) & 0xfff_ffff_ffff) << PAGE_SHIFT)
}

fn entry_phys(pte: u64, virt: u64, level: &Level) -> PhysAddr {
    let base = ((pte >> PTE_PPN_OFFSET) & 0xfff_ffff_ffff) << PAGE_SHIFT;
    PhysAddr::new(base + (virt & (level.page_size - 1)))
}

fn entry_mem_flags(pte: u64) -> MemFlags {
    let e = EntryFlags::from_bits_truncate(pte);
    let mut f = MemFlags::empty();
    if e.contains(EntryFlags::READ) {
        f |= MemFlags::READ;
    }
    if e.contains(EntryFlags::WRITE) {
        f |= MemFlags::WRITE;
    }
    if e.contains(EntryFlags::EXEC) {
        f |= MemFlags::EXEC;
    }
    if e.contains(EntryFlags::USER) {
        f |= MemFlags::USER;
    }
    if pte & PBMT_IO != 0 {
        f |= MemFlags::DEVICE;
    }
    f
}

fn terminal_entry(phys: PhysAddr, flags: MemFlags) -> u64 {
    let mut e = EntryFlags::VALID | EntryFlags::ACCESS | EntryFlags::DIRTY;
    if flags.contains(MemFlags::READ) {
        e |= EntryFlags::READ;
    }
    if flags.contains(MemFlags::WRITE) {
        e |= EntryFlags::WRITE;
    }
    if flags.contains(MemFlags::EXEC) {
        e |= EntryFlags::EXEC;
    }
    if flags.contains(MemFlags::USER) {
        e |= EntryFlags::USER;
    } else {
        // Kernel mappings are shared across all address spaces.
        e |= EntryFlags::GLOBAL;
    }

    let mut pte = (phys.ppn() << PTE_PPN_OFFSET) | e.bits();
    if flags.contains(MemFlags::DEVICE) {
        pte |= PBMT_IO;
    }
    pte
}

fn next_pt_entry(table: PhysAddr) -> u64 {
    (table.ppn() << PTE_PPN_OFFSET) | EntryFlags::VALID.bits()
}

fn table_empty<S: FrameSource>(src: &S, table: PhysAddr, entries: usize) -> bool {
    for i in 0..entries {
        let ptr = src.phys_to_ptr(table + (i * 8) as u64) as *const u64;
        // SAFETY: the table page is owned by the walker
        if unsafe { ptr.read_volatile() } != 0 {
            return false;
        }
    }
    true
}

fn page_up(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Installs a fresh next-level table underneath a hugepage entry, remapping
/// the hugepage's span with terminal entries one level down.
fn split_hugepage<S: FrameSource>(
    src: &mut S,
    levels: &[Level],
    pte_ptr: *mut u64,
    virt: u64,
) -> Result<(), PagingError> {
    let level = &levels[0];
    // SAFETY: entry pointer obtained from an owned table
    let pte = unsafe { pte_ptr.read_volatile() };

    if !entry_is_leaf(pte) {
        return Ok(());
    }

    let page_mask = !(level.page_size - 1);
    let phys = PhysAddr::new(entry_phys(pte, virt, level).data() & page_mask);
    let virt = virt & page_mask;
    let flags = entry_mem_flags(pte);

    let sub = src.alloc_table().ok_or(PagingError::OutOfMemory)?;
    create(
        src,
        &levels[1..],
        sub,
        virt,
        phys,
        level.page_size as usize,
        flags,
    )?;
    // SAFETY: as above
    unsafe { pte_ptr.write_volatile(next_pt_entry(sub)) };

    Ok(())
}

fn create<S: FrameSource>(
    src: &mut S,
    levels: &[Level],
    root: PhysAddr,
    virt: u64,
    phys: PhysAddr,
    size: usize,
    flags: MemFlags,
) -> Result<(), PagingError> {
    let mut virt = virt & !(PAGE_SIZE as u64 - 1);
    let mut phys = phys.align_down(PAGE_SIZE as u64);
    let mut size = page_up(size);

    while size > 0 {
        let mut depth = 0;
        let mut pt = root;

        let advance = loop {
            let level = &levels[depth];
            let pte_ptr = entry_ptr(src, pt, level, virt);
            // SAFETY: entry pointer obtained from an owned table
            let pte = unsafe { pte_ptr.read_volatile() };

            if level.page_size as usize <= size
                && (phys.data() | virt) & (level.page_size - 1) == 0
            {
                // A finer-grained mapping may already exist underneath; it
                // dies with the hugepage that replaces it. This cannot fail
                // since we operate along hugepage boundaries.
                if level.page_size as usize > PAGE_SIZE && entry_valid(pte) && !entry_is_leaf(pte)
                {
                    destroy(src, &levels[depth..], pt, virt, level.page_size as usize)?;
                }
                // SAFETY: as above
                unsafe { pte_ptr.write_volatile(terminal_entry(phys, flags)) };
                break level.page_size as usize;
            }

            if entry_valid(pte) {
                split_hugepage(src, &levels[depth..], pte_ptr, virt)?;
                // SAFETY: as above; re-read after a potential split
                pt = entry_next_pt(unsafe { pte_ptr.read_volatile() });
            } else {
                let new = src.alloc_table().ok_or(PagingError::OutOfMemory)?;
                // SAFETY: as above
                unsafe { pte_ptr.write_volatile(next_pt_entry(new)) };
                pt = new;
            }
            depth += 1;
        };

        phys += advance as u64;
        virt += advance as u64;
        size -= advance;
    }

    Ok(())
}

fn destroy<S: FrameSource>(
    src: &mut S,
    levels: &[Level],
    root: PhysAddr,
    virt: u64,
    size: usize,
) -> Result<(), PagingError> {
    let mut virt = virt & !(PAGE_SIZE as u64 - 1);
    let mut size = page_up(size);

    while size > 0 {
        let mut path = [PhysAddr::new(0); 5];
        let mut depth = 0;

        path[0] = root;

        // Walk down, remembering intermediate tables.
        let pte_ptr = loop {
            let level = &levels[depth];
            let pte_ptr = entry_ptr(src, path[depth], level, virt);
            // SAFETY: entry pointer obtained from an owned table
            let pte = unsafe { pte_ptr.read_volatile() };

            if !entry_valid(pte) {
                break pte_ptr;
            }

            if entry_is_leaf(pte) {
                let page_start = virt & !(level.page_size - 1);

                // virt + size may wrap to exactly 0 at the end of the address
                // space; compare with size - 1 on both sides (size and
                // page_size are never 0 here).
                if virt <= page_start
                    && virt + (size as u64 - 1) >= page_start + (level.page_size - 1)
                {
                    // The region fully covers this mapping, clear it in place.
                    break pte_ptr;
                }

                // Partial cover: split, then keep descending.
                split_hugepage(src, &levels[depth..], pte_ptr, virt)?;
            }

            // SAFETY: as above; re-read after a potential split
            path[depth + 1] = entry_next_pt(unsafe { pte_ptr.read_volatile() });
            depth += 1;
        };

        let advance = levels[depth].page_size as usize;

        // Walk up again, clearing entries and releasing empty tables.
        let mut pte_ptr = pte_ptr;
        loop {
            // SAFETY: as above
            unsafe { pte_ptr.write_volatile(0) };
            if depth == 0 || !table_empty(src, path[depth], levels[depth].entries) {
                break;
            }
            src.free_table(path[depth]);

            depth -= 1;
            pte_ptr = entry_ptr(src, path[depth], &levels[depth], virt);
        }

        if advance > size {
            break;
        }
        virt += advance as u64;
        size -= advance;
    }

    Ok(())
}

/// Maps `[virt, virt + size)` to `[phys, phys + size)` in the tree rooted at
/// `root`, using hugepages wherever size and alignment permit. An existing
/// mapping in the range is replaced.
pub fn map_range<S: FrameSource>(
    src: &mut S,
    mode: &Paging,
    root: PhysAddr,
    virt: VirtAddr,
    phys: PhysAddr,
    size: usize,
    flags: MemFlags,
) -> Result<(), PagingError> {
    create(src, mode.levels, root, virt.data() as u64, phys, size, flags)
}

/// Removes all translations for `[virt, virt + size)` from the tree rooted at
/// `root`. Hugepages partially covered by the range are split; intermediate
/// tables left empty are released back to the frame source.
pub fn unmap_range<S: FrameSource>(
    src: &mut S,
    mode: &Paging,
    root: PhysAddr,
    virt: VirtAddr,
    size: usize,
) -> Result<(), PagingError> {
    destroy(src, mode.levels, root, virt.data() as u64, size)
}

/// Resolves a virtual address through the tree rooted at `root`. Returns
/// `None` when no translation exists.
pub fn virt_to_phys<S: FrameSource>(
    src: &S,
    mode: &Paging,
    root: PhysAddr,
    virt: VirtAddr,
) -> Option<PhysAddr> {
    let virt = virt.data() as u64;
    let mut pt = root;

    for level in mode.levels {
        let pte_ptr = entry_ptr(src, pt, level, virt);
        // SAFETY: entry pointer obtained from an owned table
        let pte = unsafe { pte_ptr.read_volatile() };

        if !entry_valid(pte) {
            return None;
        }
        if entry_is_leaf(pte) {
            return Some(entry_phys(pte, virt, level));
        }
        pt = entry_next_pt(pte);
    }

    None
}

/// Copies a range of root-table entries from `from` to `to`. Used at SMP
/// bring-up to share the kernel half of the address space across the per-CPU
/// root tables.
pub fn copy_root_range<S: FrameSource>(
    src: &S,
    mode: &Paging,
    to: PhysAddr,
    from: PhysAddr,
    range: core::ops::Range<usize>,
) {
    assert!(range.end <= mode.root_entries());
    for i in range {
        let src_ptr = src.phys_to_ptr(from + (i * 8) as u64) as *const u64;
        let dst_ptr = src.phys_to_ptr(to + (i * 8) as u64) as *mut u64;
        // SAFETY: both tables are owned by the walker and at least
        // `root_entries` long
        unsafe { dst_ptr.write_volatile(src_ptr.read_volatile()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARENA_BASE: u64 = 0x100_0000;

    /// Page arena standing in for the physical allocator.
    struct Arena {
        pages: Vec<*mut [u8; PAGE_SIZE]>,
        freed: Vec<PhysAddr>,
        limit: usize,
    }

    impl Arena {
        fn new() -> Self {
            Arena {
                pages: Vec::new(),
                freed: Vec::new(),
                limit: usize::MAX,
            }
        }

        fn live_tables(&self) -> usize {
            self.pages.len() - self.freed.len()
        }

        fn alloc_root(&mut self, mode: &Paging) -> PhysAddr {
            let root = self.alloc_table().unwrap();
            for _ in 1..mode.root_pages() {
                self.alloc_table().unwrap();
            }
            root
        }
    }

    impl Drop for Arena {
        fn drop(&mut self) {
            for &p in &self.pages {
                drop(unsafe { Box::from_raw(p) });
            }
        }
    }

    impl FrameSource for Arena {
        fn alloc_table(&mut self) -> Option<PhysAddr> {
            if self.pages.len() >= self.limit {
                return None;
            }
            self.pages.push(Box::into_raw(Box::new([0; PAGE_SIZE])));
            Some(PhysAddr::new(
                ARENA_BASE + ((self.pages.len() - 1) * PAGE_SIZE) as u64,
            ))
        }

        fn free_table(&mut self, pa: PhysAddr) {
            assert!(!self.freed.contains(&pa), "double free of table page");
            self.freed.push(pa);
        }

        fn phys_to_ptr(&self, pa: PhysAddr) -> *mut u8 {
            let off = (pa.data() - ARENA_BASE) as usize;
            let page = off / PAGE_SIZE;
            unsafe { (self.pages[page] as *mut u8).add(off % PAGE_SIZE) }
        }
    }

    #[test]
    fn map_and_resolve() {
        let mut arena = Arena::new();
        let root = arena.alloc_root(&SV39);

        let virt = VirtAddr::new(0x4000_0000);
        let phys = PhysAddr::new(0x8020_0000);
        map_range(&mut arena, &SV39, root, virt, phys, 4 * PAGE_SIZE, MemFlags::RW).unwrap();

        for k in (0..4 * PAGE_SIZE).step_by(64) {
            assert_eq!(
                virt_to_phys(&arena, &SV39, root, virt + k),
                Some(phys + k as u64)
            );
        }
        assert_eq!(
            virt_to_phys(&arena, &SV39, root, virt + 4 * PAGE_SIZE),
            None
        );
    }

    #[test]
    fn unmap_removes_all_translations() {
        let mut arena = Arena::new();
        let root = arena.alloc_root(&SV39);

        let virt = VirtAddr::new(0x4000_0000);
        let phys = PhysAddr::new(0x8020_0000);
        map_range(&mut arena, &SV39, root, virt, phys, 8 * PAGE_SIZE, MemFlags::RW).unwrap();
        unmap_range(&mut arena, &SV39, root, virt, 8 * PAGE_SIZE).unwrap();

        for k in (0..8 * PAGE_SIZE).step_by(PAGE_SIZE) {
            assert_eq!(virt_to_phys(&arena, &SV39, root, virt + k), None);
        }

        // Both intermediate tables became empty and were released.
        assert_eq!(arena.live_tables(), SV39.root_pages());
    }

    #[test]
    fn hugepage_is_used_when_aligned() {
        let mut arena = Arena::new();
        let root = arena.alloc_root(&SV39);

        let virt = VirtAddr::new(0x4000_0000);
        let phys = PhysAddr::new(0x8000_0000);
        map_range(&mut arena, &SV39, root, virt, phys, MEGA_PAGE_SIZE, MemFlags::RW).unwrap();

        // Root plus a single level-1 table; the mapping is terminal there.
        assert_eq!(arena.live_tables(), SV39.root_pages() + 1);
        assert_eq!(
            virt_to_phys(&arena, &SV39, root, virt + MEGA_PAGE_SIZE - 1),
            Some(phys + (MEGA_PAGE_SIZE - 1) as u64)
        );
    }

    #[test]
    fn punching_a_hole_splits_the_hugepage() {
        let mut arena = Arena::new();
        let root = arena.alloc_root(&SV39);

        let virt = VirtAddr::new(0x4000_0000);
        let phys = PhysAddr::new(0x8000_0000);
        map_range(&mut arena, &SV39, root, virt, phys, MEGA_PAGE_SIZE, MemFlags::RW).unwrap();

        let hole = virt + MEGA_PAGE_SIZE / 2;
        unmap_range(&mut arena, &SV39, root, hole, PAGE_SIZE).unwrap();

        for k in (0..MEGA_PAGE_SIZE).step_by(PAGE_SIZE) {
            let want = if virt + k == hole {
                None
            } else {
                Some(phys + k as u64)
            };
            assert_eq!(virt_to_phys(&arena, &SV39, root, virt + k), want);
        }

        // Remapping the punched page restores full coverage.
        map_range(
            &mut arena,
            &SV39,
            root,
            hole,
            phys + (MEGA_PAGE_SIZE / 2) as u64,
            PAGE_SIZE,
            MemFlags::RW,
        )
        .unwrap();
        for k in (0..MEGA_PAGE_SIZE).step_by(PAGE_SIZE) {
            assert_eq!(
                virt_to_phys(&arena, &SV39, root, virt + k),
                Some(phys + k as u64)
            );
        }
    }

    #[test]
    fn hugepage_overwrites_finer_mapping() {
        let mut arena = Arena::new();
        let root = arena.alloc_root(&SV39);

        let virt = VirtAddr::new(0x4000_0000);
        map_range(
            &mut arena,
            &SV39,
            root,
            virt,
            PhysAddr::new(0x9000_0000),
            16 * PAGE_SIZE,
            MemFlags::RW,
        )
        .unwrap();

        let phys = PhysAddr::new(0x8000_0000);
        map_range(&mut arena, &SV39, root, virt, phys, MEGA_PAGE_SIZE, MemFlags::RW).unwrap();

        assert_eq!(virt_to_phys(&arena, &SV39, root, virt), Some(phys));
        // The now-superseded leaf table was given back.
        assert_eq!(arena.live_tables(), SV39.root_pages() + 1);
    }

    #[test]
    fn unaligned_phys_prevents_hugepages() {
        let mut arena = Arena::new();
        let root = arena.alloc_root(&SV39);

        // 2 MiB worth of pages, but the physical side is only page-aligned.
        let virt = VirtAddr::new(0x4020_0000);
        let phys = PhysAddr::new(0x8000_1000);
        map_range(&mut arena, &SV39, root, virt, phys, MEGA_PAGE_SIZE, MemFlags::RW).unwrap();

        assert_eq!(arena.live_tables(), SV39.root_pages() + 2);
        for k in (0..MEGA_PAGE_SIZE).step_by(MEGA_PAGE_SIZE / 8) {
            assert_eq!(
                virt_to_phys(&arena, &SV39, root, virt + k),
                Some(phys + k as u64)
            );
        }
    }

    #[test]
    fn alloc_failure_is_reported() {
        let mut arena = Arena::new();
        let root = arena.alloc_root(&SV39);
        arena.limit = arena.pages.len() + 1;

        let res = map_range(
            &mut arena,
            &SV39,
            root,
            VirtAddr::new(0x4000_0000),
            PhysAddr::new(0x8020_0000),
            PAGE_SIZE,
            MemFlags::RW,
        );
        assert_eq!(res, Err(PagingError::OutOfMemory));
    }

    #[test]
    fn gstage_root_spans_four_pages() {
        assert_eq!(SV39X4.root_pages(), 4);
        assert_eq!(SV48X4.root_pages(), 4);
        assert_eq!(SV39.root_pages(), 1);

        let mut arena = Arena::new();
        let root = arena.alloc_root(&SV39X4);

        // An address above bit 38 exercises the widened root index.
        let gphys = VirtAddr::new(0x60_a000_0000);
        let host = PhysAddr::new(0x8040_0000);
        map_range(&mut arena, &SV39X4, root, gphys, host, 2 * PAGE_SIZE, MemFlags::RWXU).unwrap();

        assert_eq!(
            virt_to_phys(&arena, &SV39X4, root, gphys + PAGE_SIZE),
            Some(host + PAGE_SIZE as u64)
        );
    }

    #[test]
    fn kernel_half_sharing() {
        let mut arena = Arena::new();
        let root_a = arena.alloc_root(&SV39);

        let kva = VirtAddr::new(0xffff_ffc0_0000_0000);
        map_range(
            &mut arena,
            &SV39,
            root_a,
            kva,
            PhysAddr::new(0x8020_0000),
            PAGE_SIZE,
            MemFlags::RW,
        )
        .unwrap();

        let root_b = arena.alloc_root(&SV39);
        copy_root_range(&arena, &SV39, root_b, root_a, 256..512);

        assert_eq!(
            virt_to_phys(&arena, &SV39, root_b, kva),
            Some(PhysAddr::new(0x8020_0000))
        );
    }
}
