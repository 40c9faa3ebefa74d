//! Read-only view of the initial ramdisk, mounted at `/initrd`.
//!
//! The CPIO archive is consumed lazily: lookups and directory listings walk
//! the entry iterator; file contents are borrowed straight from the
//! archive's memory. Paths are matched verbatim with any leading `/`
//! stripped.

use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::{sync::Arc, vec::Vec};

use cpio::Archive;
use riscv::{PhysAddr, VirtAddr};

use super::{DirentBuf, FileLike, Filesystem, OpenFlags, Stat, DT_DIR, DT_REG, S_IFDIR};
use crate::errno::{Errno, Result};
use crate::mm::gfp;

struct Initrd {
    base: AtomicUsize,
    size: AtomicUsize,
}

static INITRD: Initrd = Initrd {
    base: AtomicUsize::new(0),
    size: AtomicUsize::new(0),
};

/// Records the initrd's location and takes its pages out of the allocator.
pub fn init(phys: PhysAddr, size: usize) -> Result<()> {
    gfp::phys_mark_used(phys.align_down(4096), gfp::pages(size))?;

    let va = gfp::p2v(phys);
    INITRD.base.store(va.data(), Ordering::Relaxed);
    INITRD.size.store(size, Ordering::Relaxed);

    pr_info!("initrd: {} bytes at {}", size, phys);
    Ok(())
}

fn archive() -> Result<Archive<'static>> {
    let base = INITRD.base.load(Ordering::Relaxed);
    let size = INITRD.size.load(Ordering::Relaxed);
    if base == 0 {
        return Err(Errno::ENOENT);
    }

    // SAFETY: the initrd pages are reserved and directly mapped for the
    // kernel's lifetime
    let data = unsafe { core::slice::from_raw_parts(VirtAddr::new(base).as_ptr::<u8>(), size) };
    Ok(Archive::new(data))
}

/// Raw access to the archive contents, for guest loading.
pub fn raw() -> Result<&'static [u8]> {
    let base = INITRD.base.load(Ordering::Relaxed);
    let size = INITRD.size.load(Ordering::Relaxed);
    if base == 0 {
        return Err(Errno::ENOENT);
    }
    // SAFETY: as in `archive`
    Ok(unsafe { core::slice::from_raw_parts(VirtAddr::new(base).as_ptr::<u8>(), size) })
}

/// A regular file inside the archive.
struct InitrdFile {
    body: &'static [u8],
    mode: u32,
}

impl FileLike for InitrdFile {
    fn read(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let pos = pos.min(self.body.len() as u64) as usize;
        let n = buf.len().min(self.body.len() - pos);
        buf[..n].copy_from_slice(&self.body[pos..pos + n]);
        Ok(n)
    }

    fn stat(&self) -> Stat {
        Stat {
            mode: self.mode,
            size: self.body.len() as u64,
        }
    }
}

/// A directory level inside the archive.
struct InitrdDir {
    /// Prefix of all children, empty or ending in `/`.
    prefix: Vec<u8>,
}

impl InitrdDir {
    /// Direct children of this directory, in archive order.
    fn children(&self) -> Result<Vec<(u32, alloc::string::String)>> {
        let mut out: Vec<(u32, alloc::string::String)> = Vec::new();
        let prefix = core::str::from_utf8(&self.prefix).map_err(|_| Errno::EINVAL)?;

        for entry in archive()? {
            let entry = entry.map_err(|_| Errno::EINVAL)?;
            let rest = match entry.name.strip_prefix(prefix) {
                Some(rest) if !rest.is_empty() => rest,
                _ => continue,
            };

            // Grandchildren show up under their parent only
            if rest.contains('/') {
                continue;
            }

            let ty = if entry.is_dir() { DT_DIR } else { DT_REG };
            if !out.iter().any(|(_, n)| n == rest) {
                out.push((ty, alloc::string::String::from(rest)));
            }
        }

        Ok(out)
    }
}

impl FileLike for InitrdDir {
    fn stat(&self) -> Stat {
        Stat {
            mode: S_IFDIR | 0o555,
            size: 0,
        }
    }

    fn getdents(&self, pos: u64, sink: &mut DirentBuf) -> Result<u64> {
        let children = self.children()?;
        let mut next = pos;

        for (ty, name) in children.iter().skip(pos as usize) {
            if !sink.push(*ty, name) {
                break;
            }
            next += 1;
        }

        Ok(next)
    }
}

/// Filesystem entry point of `/initrd`.
pub struct InitrdFs;

/// The initrdfs singleton.
pub static INITRD_FS: InitrdFs = InitrdFs;

impl Filesystem for InitrdFs {
    fn open(&self, path: &str, flags: OpenFlags) -> Result<Arc<dyn FileLike>> {
        if flags.may_write() {
            return Err(Errno::EROFS);
        }

        let path = path.trim_start_matches('/');
        if path.is_empty() {
            return Ok(Arc::new(InitrdDir { prefix: Vec::new() }));
        }

        if let Some(entry) = archive()?.find(path).map_err(|_| Errno::EINVAL)? {
            if entry.is_dir() {
                let mut prefix = Vec::from(path.as_bytes());
                prefix.push(b'/');
                return Ok(Arc::new(InitrdDir { prefix }));
            }

            return Ok(Arc::new(InitrdFile {
                body: entry.body,
                mode: entry.header.mode,
            }));
        }

        // Directories do not always have their own archive entry; accept a
        // path that prefixes other members.
        let mut prefix = Vec::from(path.as_bytes());
        prefix.push(b'/');

        let mut found = false;
        {
            let prefix_str = core::str::from_utf8(&prefix).map_err(|_| Errno::EINVAL)?;
            for entry in archive()? {
                let entry = entry.map_err(|_| Errno::EINVAL)?;
                if entry.name.starts_with(prefix_str) {
                    found = true;
                    break;
                }
            }
        }

        if found {
            return Ok(Arc::new(InitrdDir { prefix }));
        }
        Err(Errno::ENOENT)
    }
}
