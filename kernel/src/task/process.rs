//! Process address spaces and the ELF loader.

use alloc::string::String;
use alloc::vec::Vec;

use riscv::paging::{MemFlags, PAGE_SIZE};
use riscv::{PhysAddr, VirtAddr};
use spin::Mutex;

use crate::config::{MAX_FDS, USER_HEAP_BASE, USER_STACK_BASE, USER_STACK_SIZE, USER_STACK_TOP};
use crate::errno::{Errno, Result};
use crate::fs::{self, FileHandle};
use crate::mm::{gfp, paging};

use super::uaccess;
use super::vma::{self, VmaFlags};

/// Path of the initial program; `init=` overrides. Fixed storage: boot
/// parameters are parsed before the heap exists.
static INIT_PATH: Mutex<([u8; 64], usize)> = Mutex::new(([0; 64], 0));

pub(crate) fn parse_init(arg: Option<&str>) {
    if let Some(path) = arg {
        let mut stored = INIT_PATH.lock();
        let n = path.len().min(stored.0.len());
        stored.0[..n].copy_from_slice(&path.as_bytes()[..n]);
        stored.1 = n;
    }
}

/// Returns the configured path of the initial program.
pub fn init_path() -> String {
    let stored = INIT_PATH.lock();
    if stored.1 != 0 {
        if let Ok(path) = core::str::from_utf8(&stored.0[..stored.1]) {
            return String::from(path);
        }
    }
    String::from("/initrd/bin/init")
}

/// Register state a freshly loaded image starts with.
#[derive(Debug, Clone, Copy)]
pub struct StartContext {
    /// Entry point.
    pub pc: usize,
    /// Initial stack pointer.
    pub sp: usize,
    /// Argument count.
    pub argc: usize,
    /// User address of the argument vector.
    pub argv: usize,
    /// User address of the environment vector.
    pub envp: usize,
}

/// A user process: page table, VMAs, heap, working directory and files.
pub struct Process {
    /// Root of the process page table; only the user half is populated.
    pub root: PhysAddr,
    /// All memory areas, non-overlapping.
    pub vmas: Vec<vma::Vma>,
    /// Current program break.
    pub brk: usize,
    /// Current working directory, absolute.
    pub cwd: String,
    /// Open file table.
    pub fds: [Option<FileHandle>; MAX_FDS],
}

impl Process {
    /// Creates an empty address space.
    pub fn new() -> Result<Process> {
        let root_va = gfp::zalloc_pages(1)?;

        const NO_FD: Option<FileHandle> = None;
        Ok(Process {
            root: gfp::v2p(root_va),
            vmas: Vec::new(),
            brk: USER_HEAP_BASE,
            cwd: String::from("/"),
            fds: [NO_FD; MAX_FDS],
        })
    }

    /// Finds a free file descriptor slot.
    pub fn alloc_fd(&self) -> Result<usize> {
        self.fds
            .iter()
            .position(|f| f.is_none())
            .ok_or(Errno::EMSGSIZE)
    }

    /// Returns the handle behind `fd`.
    pub fn fd(&mut self, fd: usize) -> Result<&mut FileHandle> {
        self.fds
            .get_mut(fd)
            .and_then(|f| f.as_mut())
            .ok_or(Errno::EBADF)
    }

    /// Resolves a path relative to this process's working directory.
    pub fn absolute_path(&self, path: &str) -> String {
        fs::canonicalize(&self.cwd, path)
    }
}

/// Releases everything a process owns. The task record stays behind until
/// the parent reaps it.
pub fn process_destroy(p: &mut Process) {
    vma::uvmas_destroy(p);

    for fd in p.fds.iter_mut() {
        *fd = None;
    }

    if p.root != PhysAddr::new(0) {
        let _ = gfp::free_pages(gfp::p2v(p.root), 1);
        p.root = PhysAddr::new(0);
    }
}

/// Handles a user page fault; recoverable only for LAZY VMAs.
pub fn process_handle_fault(p: &mut Process, addr: usize, is_write: bool) -> Result<()> {
    vma::uvma_handle_fault(p, addr, is_write)
}

/// Loads an ELF image into `p` and prepares the initial stack.
///
/// The address space must be empty; all segments are backed eagerly and
/// zero-filled beyond their file contents, which makes BSS handling free.
pub fn load_image(
    p: &mut Process,
    image: &[u8],
    argv: &[String],
    envp: &[String],
) -> Result<StartContext> {
    let elf = elf::Elf::parse_for_machine(image, elf::EM_RISCV).map_err(|_| Errno::EINVAL)?;

    for ph in elf.program_headers() {
        let ph = ph.map_err(|_| Errno::EINVAL)?;
        if !ph.is_load() {
            continue;
        }

        if ph.p_align != PAGE_SIZE as u64 {
            return Err(Errno::EINVAL);
        }

        let mut flags = VmaFlags::USER;
        if ph.is_readable() {
            flags |= VmaFlags::R;
        }
        if ph.is_writable() {
            flags |= VmaFlags::W;
        }
        if ph.is_executable() {
            flags |= VmaFlags::EXEC;
        }

        let base = ph.p_vaddr as usize;
        let size = page_up(ph.p_memsz as usize);
        vma::uvma_create(p, base, size, flags, "elf")?;

        let data = elf.segment_data(&ph).map_err(|_| Errno::EINVAL)?;
        if uaccess::copy_to_user(p, base, data) != data.len() {
            return Err(Errno::ERANGE);
        }
    }

    vma::uvma_create(
        p,
        USER_STACK_BASE,
        USER_STACK_SIZE,
        VmaFlags::USER | VmaFlags::RW,
        "stack",
    )?;

    let (sp, argvp, envpp) = setup_user_stack(p, argv, envp)?;

    Ok(StartContext {
        pc: elf.header().e_entry as usize,
        sp,
        argc: argv.len(),
        argv: argvp,
        envp: envpp,
    })
}

/// Copies argument and environment strings onto the fresh stack and builds
/// the NULL-terminated pointer vectors.
fn setup_user_stack(p: &Process, argv: &[String], envp: &[String]) -> Result<(usize, usize, usize)> {
    let mut sp = USER_STACK_TOP;

    let mut push_strings = |sp: &mut usize, strings: &[String]| -> Result<Vec<usize>> {
        let mut ptrs = Vec::with_capacity(strings.len() + 1);
        for s in strings {
            *sp -= s.len() + 1;
            if uaccess::copy_to_user(p, *sp, s.as_bytes()) != s.len() {
                return Err(Errno::EFAULT);
            }
            // strings are NUL-terminated; the stack VMA starts zeroed
            ptrs.push(*sp);
        }
        ptrs.push(0);
        Ok(ptrs)
    };

    let argv_ptrs = push_strings(&mut sp, argv)?;
    let envp_ptrs = push_strings(&mut sp, envp)?;

    let mut push_vector = |sp: &mut usize, ptrs: &[usize]| -> Result<usize> {
        *sp -= ptrs.len() * core::mem::size_of::<usize>();
        *sp &= !0xf;
        for (i, ptr) in ptrs.iter().enumerate() {
            uaccess::put_user(p, *sp + i * core::mem::size_of::<usize>(), *ptr)?;
        }
        Ok(*sp)
    };

    let envpp = push_vector(&mut sp, &envp_ptrs)?;
    let argvp = push_vector(&mut sp, &argv_ptrs)?;

    // Final alignment for the entry point
    sp &= !0xf;

    Ok((sp, argvp, envpp))
}

/// Loads the program at `path` into `p`.
pub fn load_from_path(
    p: &mut Process,
    path: &str,
    argv: &[String],
    envp: &[String],
) -> Result<StartContext> {
    let image = fs::read_file(&p.absolute_path(path))?;
    load_image(p, &image, argv, envp)
}

/// Grows the heap up to `addr`; the `brk` syscall backend.
pub fn do_brk(p: &mut Process, addr: usize) -> Result<usize> {
    if addr == 0 {
        return Ok(p.brk);
    }
    if addr < USER_HEAP_BASE {
        return Err(Errno::EINVAL);
    }

    let cur_end = page_up(p.brk);
    let new_end = page_up(addr);

    if new_end > cur_end {
        let grow = new_end - cur_end;

        match p.vmas.iter().position(|v| v.name == "heap") {
            Some(heap) => {
                // Extend the existing heap area with fresh zeroed pages
                if p.vmas[heap].base + p.vmas[heap].size != cur_end {
                    return Err(Errno::EINVAL);
                }

                let phys = gfp::phys_pages_alloc_aligned(gfp::pages(grow), PAGE_SIZE)?;
                paging::map_range_on(
                    p.root,
                    VirtAddr::new(cur_end),
                    phys,
                    grow,
                    MemFlags::RW | MemFlags::USER,
                )?;

                p.vmas[heap].size += grow;
                uaccess::umemset(p, cur_end, 0, grow);
            }
            None => {
                vma::uvma_create(
                    p,
                    USER_HEAP_BASE,
                    new_end - USER_HEAP_BASE,
                    VmaFlags::USER | VmaFlags::RW,
                    "heap",
                )?;
            }
        }
    }

    p.brk = addr;
    // Heap growth may introduce new top-level entries
    crate::percpu::this_per_cpu().set_pt_needs_update();
    Ok(addr)
}

fn page_up(n: usize) -> usize {
    (n + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}
