//! User memory access.
//!
//! User pointers are never dereferenced directly. Every transfer resolves
//! the user page through the process's page table and touches the backing
//! memory via the kernel's direct map, page by page. A user pointer that
//! does not resolve terminates the transfer; callers decide whether a short
//! transfer is an error (it usually maps to `EFAULT`).

use riscv::paging::PAGE_SIZE;
use riscv::VirtAddr;

use alloc::string::String;
use alloc::vec::Vec;

use crate::errno::{Errno, Result};
use crate::mm::{gfp, paging};

use super::process::Process;

fn bytes_in_page(addr: usize) -> usize {
    PAGE_SIZE - (addr & (PAGE_SIZE - 1))
}

/// Resolves one user address into a direct-map pointer, or `None` when the
/// address has no translation.
pub fn user_to_direct(p: &Process, uaddr: usize) -> Option<*mut u8> {
    let pa = paging::get_phys_on(p.root, VirtAddr::new(uaddr))?;
    Some(gfp::p2v(pa).as_mut_ptr())
}

/// Copies `src` into user memory at `udst`. Returns the bytes written;
/// short when an unmapped page is hit.
pub fn copy_to_user(p: &Process, udst: usize, src: &[u8]) -> usize {
    let mut done = 0;

    while done < src.len() {
        let direct = match user_to_direct(p, udst + done) {
            Some(ptr) => ptr,
            None => break,
        };

        let chunk = (src.len() - done).min(bytes_in_page(udst + done));
        // SAFETY: `direct` points at a mapped user page via the direct map
        unsafe { core::ptr::copy_nonoverlapping(src[done..].as_ptr(), direct, chunk) };
        done += chunk;
    }

    done
}

/// Copies user memory at `usrc` into `dst`. Returns the bytes read; short
/// when an unmapped page is hit.
pub fn copy_from_user(p: &Process, dst: &mut [u8], usrc: usize) -> usize {
    let mut done = 0;

    while done < dst.len() {
        let direct = match user_to_direct(p, usrc + done) {
            Some(ptr) => ptr,
            None => break,
        };

        let chunk = (dst.len() - done).min(bytes_in_page(usrc + done));
        // SAFETY: as in copy_to_user
        unsafe { core::ptr::copy_nonoverlapping(direct, dst[done..].as_mut_ptr(), chunk) };
        done += chunk;
    }

    done
}

/// Fills `n` bytes of user memory with `c`. Returns the bytes written.
pub fn umemset(p: &Process, udst: usize, c: u8, n: usize) -> usize {
    let mut done = 0;

    while done < n {
        let direct = match user_to_direct(p, udst + done) {
            Some(ptr) => ptr,
            None => break,
        };

        let chunk = (n - done).min(bytes_in_page(udst + done));
        // SAFETY: as in copy_to_user
        unsafe { core::ptr::write_bytes(direct, c, chunk) };
        done += chunk;
    }

    done
}

/// Copies a NUL-terminated user string of at most `max` bytes.
pub fn ustrncpy(p: &Process, usrc: usize, max: usize) -> Result<String> {
    let mut out = Vec::new();

    for i in 0..max {
        let mut byte = [0u8];
        if copy_from_user(p, &mut byte, usrc + i) != 1 {
            return Err(Errno::EFAULT);
        }
        if byte[0] == 0 {
            return String::from_utf8(out).map_err(|_| Errno::EINVAL);
        }
        out.push(byte[0]);
    }

    Err(Errno::ENAMETOOLONG)
}

/// Reads a user value of plain-data type `T`.
pub fn get_user<T: Copy>(p: &Process, uaddr: usize) -> Result<T> {
    let mut val = core::mem::MaybeUninit::<T>::uninit();
    // SAFETY: the buffer spans exactly one T
    let buf = unsafe {
        core::slice::from_raw_parts_mut(val.as_mut_ptr() as *mut u8, core::mem::size_of::<T>())
    };

    if copy_from_user(p, buf, uaddr) != core::mem::size_of::<T>() {
        return Err(Errno::EFAULT);
    }
    // SAFETY: fully initialized above
    Ok(unsafe { val.assume_init() })
}

/// Writes a user value of plain-data type `T`.
pub fn put_user<T: Copy>(p: &Process, uaddr: usize, val: T) -> Result<()> {
    // SAFETY: the buffer spans exactly one T
    let buf = unsafe {
        core::slice::from_raw_parts(&val as *const T as *const u8, core::mem::size_of::<T>())
    };

    if copy_to_user(p, uaddr, buf) != core::mem::size_of::<T>() {
        return Err(Errno::EFAULT);
    }
    Ok(())
}
