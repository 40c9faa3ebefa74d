//! User virtual memory areas.
//!
//! A process's address space is a list of non-overlapping VMAs, all inside
//! `[USER_START, USER_END)`. Eager VMAs get contiguous physical backing at
//! creation; LAZY VMAs fault their pages in one at a time. Every page handed
//! to userspace is zeroed first.

use bitflags::bitflags;

use riscv::paging::{MemFlags, PAGE_SIZE};
use riscv::VirtAddr;

use crate::config::{USER_END, USER_START};
use crate::errno::{Errno, Result};
use crate::mm::{gfp, paging};
use crate::task::uaccess;

use super::process::Process;

bitflags! {
    /// VMA attributes.
    pub struct VmaFlags: u32 {
        /// Backing pages are allocated on first fault.
        const LAZY = 1 << 0;
        /// User-accessible mapping.
        const USER = 1 << 1;
        /// Readable.
        const R = 1 << 2;
        /// Writable.
        const W = 1 << 3;
        /// Executable.
        const EXEC = 1 << 4;

        /// Readable and writable.
        const RW = Self::R.bits | Self::W.bits;
    }
}

/// One user memory area.
#[derive(Debug, Clone)]
pub struct Vma {
    /// First user address of the area.
    pub base: usize,
    /// Size in bytes, a page multiple.
    pub size: usize,
    /// Attributes.
    pub flags: VmaFlags,
    /// Name shown in listings.
    pub name: &'static str,
}

impl Vma {
    /// Whether `addr` falls into this area.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.size
    }

    fn mem_flags(&self) -> MemFlags {
        let mut flags = MemFlags::USER;
        if self.flags.contains(VmaFlags::R) {
            flags |= MemFlags::READ;
        }
        if self.flags.contains(VmaFlags::W) {
            flags |= MemFlags::WRITE;
        }
        if self.flags.contains(VmaFlags::EXEC) {
            flags |= MemFlags::EXEC;
        }
        flags
    }
}

fn is_user_range(base: usize, size: usize) -> bool {
    base >= USER_START && base < USER_END && base + size <= USER_END
}

fn collides(vma: &Vma, base: usize, size: usize) -> bool {
    base < vma.base + vma.size && vma.base < base + size
}

/// Creates a VMA in `p`. Eager areas receive zeroed physical backing.
pub fn uvma_create(
    p: &mut Process,
    base: usize,
    size: usize,
    flags: VmaFlags,
    name: &'static str,
) -> Result<()> {
    if base % PAGE_SIZE != 0 || size == 0 || size % PAGE_SIZE != 0 {
        return Err(Errno::EINVAL);
    }
    if !is_user_range(base, size) {
        return Err(Errno::ERANGE);
    }
    if p.vmas.iter().any(|vma| collides(vma, base, size)) {
        return Err(Errno::EINVAL);
    }

    let vma = Vma {
        base,
        size,
        flags: flags | VmaFlags::USER,
        name,
    };

    if !flags.contains(VmaFlags::LAZY) {
        let phys = gfp::phys_pages_alloc_aligned(gfp::pages(size), PAGE_SIZE)?;

        if let Err(e) =
            paging::map_range_on(p.root, VirtAddr::new(base), phys, size, vma.mem_flags())
        {
            let _ = gfp::phys_free_pages(phys, gfp::pages(size));
            return Err(e);
        }

        // New user memory must read as zero; reach it through the direct map
        uaccess::umemset(p, base, 0, size);
    }

    p.vmas.push(vma);
    Ok(())
}

/// Releases one VMA's backing and translation.
fn uvma_destroy(p: &mut Process, vma: &Vma) -> Result<()> {
    // Lazy areas may be sparsely populated; walk them page-wise
    for off in (0..vma.size).step_by(PAGE_SIZE) {
        let va = VirtAddr::new(vma.base + off);
        if let Some(pa) = paging::get_phys_on(p.root, va) {
            paging::unmap_range_on(p.root, va, PAGE_SIZE)?;
            gfp::phys_free_pages(pa.align_down(PAGE_SIZE as u64), 1)?;
        }
    }
    Ok(())
}

/// Destroys every VMA of a process.
pub fn uvmas_destroy(p: &mut Process) {
    let vmas = core::mem::take(&mut p.vmas);
    for vma in &vmas {
        if uvma_destroy(p, vma).is_err() {
            panic!("destroying VMA {} of a dead process failed", vma.name);
        }
    }
}

/// Finds the VMA containing `addr`.
pub fn uvma_find<'p>(p: &'p Process, addr: usize) -> Option<&'p Vma> {
    p.vmas.iter().find(|vma| vma.contains(addr))
}

/// Handles a fault inside a LAZY VMA by installing a fresh zero page.
pub fn uvma_handle_fault(p: &mut Process, addr: usize, is_write: bool) -> Result<()> {
    let vma = uvma_find(p, addr).ok_or(Errno::EFAULT)?.clone();

    if !vma.flags.contains(VmaFlags::LAZY) {
        return Err(Errno::EFAULT);
    }
    if is_write && !vma.flags.contains(VmaFlags::W) {
        return Err(Errno::EFAULT);
    }

    let page = VirtAddr::new(addr).align_down(PAGE_SIZE as u64);
    if paging::get_phys_on(p.root, page).is_some() {
        // Raced against our own fault path; nothing to do
        return Ok(());
    }

    let phys = gfp::phys_pages_alloc_aligned(1, PAGE_SIZE)?;
    // SAFETY: fresh page, reached through the direct map
    unsafe { core::ptr::write_bytes(gfp::p2v(phys).as_mut_ptr::<u8>(), 0, PAGE_SIZE) };

    paging::map_range_on(p.root, page, phys, PAGE_SIZE, vma.mem_flags())
}

/// Replicates `vma` from `src` into `dst`, duplicating all mapped contents.
pub fn uvma_duplicate(dst: &mut Process, src: &Process, vma: &Vma) -> Result<()> {
    uvma_create(dst, vma.base, vma.size, vma.flags, vma.name)?;

    for off in (0..vma.size).step_by(PAGE_SIZE) {
        let va = VirtAddr::new(vma.base + off);

        let src_pa = match paging::get_phys_on(src.root, va) {
            Some(pa) => pa,
            // Unpopulated lazy page: stays unpopulated in the copy
            None => continue,
        };

        if paging::get_phys_on(dst.root, va).is_none() {
            let phys = gfp::phys_pages_alloc_aligned(1, PAGE_SIZE)?;
            paging::map_range_on(dst.root, va, phys, PAGE_SIZE, vma.mem_flags())?;
        }
        let dst_pa = paging::get_phys_on(dst.root, va).ok_or(Errno::EFAULT)?;

        // SAFETY: both pages are RAM reached through the direct map
        unsafe {
            core::ptr::copy_nonoverlapping(
                gfp::p2v(src_pa).as_ptr::<u8>(),
                gfp::p2v(dst_pa).as_mut_ptr::<u8>(),
                PAGE_SIZE,
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vma(base: usize, size: usize) -> Vma {
        Vma {
            base,
            size,
            flags: VmaFlags::RW | VmaFlags::USER,
            name: "test",
        }
    }

    #[test]
    fn collision_detection() {
        let a = vma(0x4000_0000, 0x4000);

        assert!(collides(&a, 0x4000_0000, 0x1000));
        assert!(collides(&a, 0x4000_3000, 0x2000));
        assert!(collides(&a, 0x3fff_f000, 0x2000));
        assert!(!collides(&a, 0x4000_4000, 0x1000));
        assert!(!collides(&a, 0x3fff_f000, 0x1000));
    }

    #[test]
    fn user_range_bounds() {
        assert!(is_user_range(USER_START, PAGE_SIZE));
        assert!(is_user_range(USER_END - PAGE_SIZE, PAGE_SIZE));
        assert!(!is_user_range(0, PAGE_SIZE));
        assert!(!is_user_range(USER_END, PAGE_SIZE));
        assert!(!is_user_range(USER_END - PAGE_SIZE, 2 * PAGE_SIZE));
    }

    #[test]
    fn contains_is_half_open() {
        let a = vma(0x4000_0000, 0x1000);
        assert!(a.contains(0x4000_0000));
        assert!(a.contains(0x4000_0fff));
        assert!(!a.contains(0x4000_1000));
    }
}
