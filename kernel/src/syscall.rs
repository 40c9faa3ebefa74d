//! System call dispatch.
//!
//! One register selects the call, six carry arguments. The number space is
//! split at [`SYS_GRINCH_BASE`]: POSIX-flavoured calls below, grinch
//! extensions above. Each table entry is a thunk extracting typed
//! arguments for its handler.
//!
//! Return policy: errors are always written back. On success, the three
//! transfer-of-control calls `exit`, `execve` and `wait` write nothing -
//! the task is gone, its address space has changed, or the waker delivers
//! the value. Unknown numbers yield `-ENOSYS`.

use alloc::string::String;
use alloc::vec::Vec;

use crate::errno::{to_sysret, Errno, Result};
use crate::fs::{self, DirentBuf, FileHandle, OpenFlags, RawStat};
use crate::percpu::this_per_cpu;
use crate::task::{self, process, uaccess, vma};
use crate::vmm;
use crate::{mm, timer, ttp};

/// Maximum length of a path argument.
const MAX_PATHLEN: usize = 64;

/// Limits for `execve` vectors.
const MAX_ARGS: usize = 32;
const MAX_ARG_LEN: usize = 256;

/// Number of `read`.
pub const SYS_READ: usize = 0;
/// Number of `write`.
pub const SYS_WRITE: usize = 1;
/// Number of `open`.
pub const SYS_OPEN: usize = 2;
/// Number of `close`.
pub const SYS_CLOSE: usize = 3;
/// Number of `stat`.
pub const SYS_STAT: usize = 4;
/// Number of `brk`.
pub const SYS_BRK: usize = 12;
/// Number of `ioctl`.
pub const SYS_IOCTL: usize = 16;
/// Number of `sched_yield`.
pub const SYS_SCHED_YIELD: usize = 24;
/// Number of `getpid`.
pub const SYS_GETPID: usize = 39;
/// Number of `fork`.
pub const SYS_FORK: usize = 57;
/// Number of `execve`.
pub const SYS_EXECVE: usize = 59;
/// Number of `exit`.
pub const SYS_EXIT: usize = 60;
/// Number of `getdents`.
pub const SYS_GETDENTS: usize = 78;
/// Number of `getcwd`.
pub const SYS_GETCWD: usize = 79;
/// Number of `chdir`.
pub const SYS_CHDIR: usize = 80;
/// Number of `mkdir`.
pub const SYS_MKDIR: usize = 83;
/// Number of `wait`.
pub const SYS_WAIT: usize = 260;

/// First grinch-specific call number.
pub const SYS_GRINCH_BASE: usize = 1337;

/// Number of `usleep`.
pub const SYS_USLEEP: usize = 1337;
/// Number of `gettime`.
pub const SYS_GETTIME: usize = 1338;
/// Number of `create_grinch_vm`.
pub const SYS_CREATE_GRINCH_VM: usize = 1339;
/// Number of `kstat`.
pub const SYS_KSTAT: usize = 1340;
/// Number of `gcall`.
pub const SYS_GCALL: usize = 1341;

type SyscallFn = fn(&[usize; 6]) -> Result<isize>;

const POSIX_TABLE_LEN: usize = SYS_WAIT + 1;

static SYSCALLS: [Option<SyscallFn>; POSIX_TABLE_LEN] = {
    let mut t: [Option<SyscallFn>; POSIX_TABLE_LEN] = [None; POSIX_TABLE_LEN];
    t[SYS_READ] = Some(sys_read);
    t[SYS_WRITE] = Some(sys_write);
    t[SYS_OPEN] = Some(sys_open);
    t[SYS_CLOSE] = Some(sys_close);
    t[SYS_STAT] = Some(sys_stat);
    t[SYS_BRK] = Some(sys_brk);
    t[SYS_IOCTL] = Some(sys_ioctl);
    t[SYS_SCHED_YIELD] = Some(sys_sched_yield);
    t[SYS_GETPID] = Some(sys_getpid);
    t[SYS_FORK] = Some(sys_fork);
    t[SYS_EXECVE] = Some(sys_execve);
    t[SYS_EXIT] = Some(sys_exit);
    t[SYS_GETDENTS] = Some(sys_getdents);
    t[SYS_GETCWD] = Some(sys_getcwd);
    t[SYS_CHDIR] = Some(sys_chdir);
    t[SYS_MKDIR] = Some(sys_mkdir);
    t[SYS_WAIT] = Some(sys_wait);
    t
};

static GRINCH_CALLS: [Option<SyscallFn>; 5] = [
    Some(sys_usleep),
    Some(sys_gettime),
    Some(sys_create_grinch_vm),
    Some(sys_kstat),
    Some(sys_kstat), // gcall shares the kstat surface
];

/// Dispatches one system call of the current task.
pub fn dispatch(no: usize, args: &[usize; 6]) {
    let handler = if no < SYSCALLS.len() {
        SYSCALLS[no]
    } else if (SYS_GRINCH_BASE..SYS_GRINCH_BASE + GRINCH_CALLS.len()).contains(&no) {
        GRINCH_CALLS[no - SYS_GRINCH_BASE]
    } else {
        None
    };

    let ret = match handler {
        Some(handler) => to_sysret(handler(args)),
        None => Errno::ENOSYS.as_neg(),
    };

    // 1. On errors, always set the return value.
    // 2. exit, execve and wait get special treatment.
    // 3. The call might have killed the task; check for its existence.
    let transfers_control = matches!(no, SYS_EXIT | SYS_EXECVE | SYS_WAIT);
    if ret < 0 || !transfers_control {
        if let Some(pid) = this_per_cpu().current_task() {
            let _ = task::with_task(pid, |t| t.regs.set_retval(ret));
        }
    }
}

fn with_current_process<R>(
    f: impl FnOnce(&mut process::Process) -> Result<R>,
) -> Result<R> {
    task::with_current(|t| match t.process_mut() {
        Some(p) => f(p),
        None => Err(Errno::EINVAL),
    })
}

fn user_path(p: &process::Process, uptr: usize) -> Result<String> {
    let path = uaccess::ustrncpy(p, uptr, MAX_PATHLEN)?;
    Ok(p.absolute_path(&path))
}

fn sys_read(args: &[usize; 6]) -> Result<isize> {
    let (fd, ubuf, count) = (args[0], args[1], args[2]);

    with_current_process(|p| {
        let handle = p.fd(fd)?;
        if !handle.may_read {
            return Err(Errno::EBADF);
        }
        let (file, mut pos) = (handle.file.clone(), handle.pos);

        let mut kbuf = [0u8; 512];
        let mut done = 0;
        while done < count {
            let chunk = (count - done).min(kbuf.len());
            let n = file.read(pos, &mut kbuf[..chunk])?;
            if n == 0 {
                break;
            }

            if uaccess::copy_to_user(p, ubuf + done, &kbuf[..n]) != n {
                return Err(Errno::EFAULT);
            }
            pos += n as u64;
            done += n;

            if n < chunk {
                break;
            }
        }

        p.fd(fd)?.pos = pos;
        Ok(done as isize)
    })
}

fn sys_write(args: &[usize; 6]) -> Result<isize> {
    let (fd, ubuf, count) = (args[0], args[1], args[2]);

    with_current_process(|p| {
        let handle = p.fd(fd)?;
        if !handle.may_write {
            return Err(Errno::EBADF);
        }
        let (file, mut pos) = (handle.file.clone(), handle.pos);

        let mut kbuf = [0u8; 512];
        let mut done = 0;
        while done < count {
            let chunk = (count - done).min(kbuf.len());
            if uaccess::copy_from_user(p, &mut kbuf[..chunk], ubuf + done) != chunk {
                return Err(Errno::EFAULT);
            }

            let n = file.write(pos, &kbuf[..chunk])?;
            pos += n as u64;
            done += n;

            if n < chunk {
                break;
            }
        }

        p.fd(fd)?.pos = pos;
        Ok(done as isize)
    })
}

fn sys_open(args: &[usize; 6]) -> Result<isize> {
    let (upath, flags) = (args[0], OpenFlags(args[1] as u32));

    with_current_process(|p| {
        let path = user_path(p, upath)?;
        let file = fs::open(&path, flags)?;

        let fd = p.alloc_fd()?;
        p.fds[fd] = Some(FileHandle::new(file, flags));
        Ok(fd as isize)
    })
}

fn sys_close(args: &[usize; 6]) -> Result<isize> {
    let fd = args[0];

    with_current_process(|p| {
        p.fd(fd)?;
        p.fds[fd] = None;
        Ok(0)
    })
}

fn sys_stat(args: &[usize; 6]) -> Result<isize> {
    let (upath, ustat) = (args[0], args[1]);

    with_current_process(|p| {
        let path = user_path(p, upath)?;
        let stat = fs::stat(&path)?;

        uaccess::put_user(p, ustat, RawStat::from(stat))?;
        Ok(0)
    })
}

fn sys_brk(args: &[usize; 6]) -> Result<isize> {
    with_current_process(|p| process::do_brk(p, args[0]).map(|brk| brk as isize))
}

fn sys_ioctl(args: &[usize; 6]) -> Result<isize> {
    let (fd, cmd, arg) = (args[0], args[1], args[2]);

    with_current_process(|p| {
        let handle = p.fd(fd)?;
        handle.file.ioctl(cmd, arg)
    })
}

fn sys_sched_yield(_args: &[usize; 6]) -> Result<isize> {
    this_per_cpu().set_schedule();
    Ok(0)
}

fn sys_getpid(_args: &[usize; 6]) -> Result<isize> {
    Ok(task::current_pid() as isize)
}

fn sys_fork(_args: &[usize; 6]) -> Result<isize> {
    task::do_fork()
}

/// Reads a NULL-terminated user pointer vector of strings.
fn copy_user_vector(p: &process::Process, uvec: usize) -> Result<Vec<String>> {
    let mut out = Vec::new();
    if uvec == 0 {
        return Ok(out);
    }

    for i in 0..MAX_ARGS {
        let uptr: usize = uaccess::get_user(p, uvec + i * core::mem::size_of::<usize>())?;
        if uptr == 0 {
            return Ok(out);
        }
        out.push(uaccess::ustrncpy(p, uptr, MAX_ARG_LEN)?);
    }

    Err(Errno::E2BIG)
}

fn sys_execve(args: &[usize; 6]) -> Result<isize> {
    let (upath, uargv, uenvp) = (args[0], args[1], args[2]);

    // Gather everything from the old image before tearing it down
    let (path, argv, envp, image) = with_current_process(|p| {
        let path = user_path(p, upath)?;
        let argv = copy_user_vector(p, uargv)?;
        let envp = copy_user_vector(p, uenvp)?;
        let image = fs::read_file(&path)?;

        // Validate early; after this point failure kills the process
        elf::Elf::parse_for_machine(&image, elf::EM_RISCV).map_err(|_| Errno::EINVAL)?;

        Ok((path, argv, envp, image))
    })?;

    let loaded = with_current_process(|p| {
        vma::uvmas_destroy(p);
        p.brk = crate::config::USER_HEAP_BASE;

        process::load_image(p, &image, &argv, &envp)
    });

    match loaded {
        Ok(ctx) => {
            task::with_current_regs(|regs| {
                *regs = crate::arch::Registers::new();
                regs.pc = ctx.pc;
                regs.sp = ctx.sp;
                regs.a0 = ctx.argc;
                regs.a1 = ctx.argv;
                regs.a2 = ctx.envp;
            });
            task::with_current(|t| t.name = path);

            this_per_cpu().set_pt_needs_update();
            Ok(0)
        }
        Err(e) => {
            // The old address space is gone already
            task::exit_current(Errno::ENOMEM.as_neg() as i64);
            Err(e)
        }
    }
}

fn sys_exit(args: &[usize; 6]) -> Result<isize> {
    task::exit_current(args[0] as i64);
    Ok(0)
}

fn sys_getdents(args: &[usize; 6]) -> Result<isize> {
    let (fd, ubuf, size) = (args[0], args[1], args[2]);

    with_current_process(|p| {
        let handle = p.fd(fd)?;
        let (file, pos) = (handle.file.clone(), handle.pos);

        let mut sink = DirentBuf::new(size);
        let next = file.getdents(pos, &mut sink)?;

        let bytes = sink.bytes();
        if uaccess::copy_to_user(p, ubuf, bytes) != bytes.len() {
            return Err(Errno::EFAULT);
        }

        p.fd(fd)?.pos = next;
        Ok(bytes.len() as isize)
    })
}

fn sys_getcwd(args: &[usize; 6]) -> Result<isize> {
    let (ubuf, size) = (args[0], args[1]);

    with_current_process(|p| {
        let cwd = p.cwd.clone();
        if cwd.len() + 1 > size {
            return Err(Errno::ERANGE);
        }

        let mut bytes = Vec::from(cwd.as_bytes());
        bytes.push(0);
        if uaccess::copy_to_user(p, ubuf, &bytes) != bytes.len() {
            return Err(Errno::EFAULT);
        }
        Ok(bytes.len() as isize)
    })
}

fn sys_chdir(args: &[usize; 6]) -> Result<isize> {
    with_current_process(|p| {
        let path = user_path(p, args[0])?;

        let stat = fs::stat(&path)?;
        if stat.mode & fs::S_IFMT != fs::S_IFDIR {
            return Err(Errno::ENOTDIR);
        }

        p.cwd = path;
        Ok(0)
    })
}

fn sys_mkdir(args: &[usize; 6]) -> Result<isize> {
    with_current_process(|p| {
        let path = user_path(p, args[0])?;
        fs::mkdir(&path)?;
        Ok(0)
    })
}

fn sys_wait(args: &[usize; 6]) -> Result<isize> {
    let (pid, ustatus, options) = (args[0] as i64, args[1], args[2]);

    task::do_wait(pid, ustatus, options)?;
    Ok(0)
}

fn sys_usleep(args: &[usize; 6]) -> Result<isize> {
    let usec = args[0] as u64;

    let wakeup = timer::get_wall_ns() + usec * 1_000;
    task::sleep_current_until(wakeup);

    // The task resumes with this return value once the timer fires
    task::with_current_regs(|regs| regs.set_retval(0));

    this_per_cpu().set_schedule();
    this_per_cpu().set_current_task(None);

    Ok(0)
}

fn sys_gettime(args: &[usize; 6]) -> Result<isize> {
    let (clockid, uts) = (args[0] as i64, args[1]);

    if clockid != 0 {
        return Err(Errno::EINVAL);
    }

    let ns = timer::get_wall_ns();
    let ts = [(ns / 1_000_000_000) as i64, (ns % 1_000_000_000) as i64];

    with_current_process(|p| {
        uaccess::put_user(p, uts, ts)?;
        Ok(0)
    })
}

fn sys_create_grinch_vm(_args: &[usize; 6]) -> Result<isize> {
    ttp::emit(ttp::Event::Hypercall(SYS_CREATE_GRINCH_VM));
    vmm::create_grinch_vm().map(|pid| pid as isize)
}

/// kstat/gcall subcodes.
const KSTAT_PS: usize = 0;
const KSTAT_KHEAP: usize = 1;
const KSTAT_MAPS: usize = 2;
const KSTAT_TTP: usize = 3;

fn sys_kstat(args: &[usize; 6]) -> Result<isize> {
    match args[0] {
        KSTAT_PS => {
            task::tasks_dump();
            Ok(0)
        }
        KSTAT_KHEAP => {
            let (used, free) = mm::kheap::stats();
            pr!("kheap: {} bytes used, {} bytes free", used, free);
            pr!("pages: {} free", mm::gfp::free_page_count());
            Ok(0)
        }
        KSTAT_MAPS => {
            task::process_show_vmas(args[1] as task::Pid);
            Ok(0)
        }
        KSTAT_TTP => {
            ttp::dump();
            Ok(0)
        }
        _ => Err(Errno::ENOSYS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_layout() {
        assert!(SYSCALLS[SYS_READ].is_some());
        assert!(SYSCALLS[SYS_WRITE].is_some());
        assert!(SYSCALLS[SYS_FORK].is_some());
        assert!(SYSCALLS[SYS_WAIT].is_some());
        // Gaps stay empty
        assert!(SYSCALLS[5].is_none());
        assert!(SYSCALLS[100].is_none());

        assert_eq!(SYS_GRINCH_BASE, SYS_USLEEP);
        assert_eq!(GRINCH_CALLS.len(), 5);
    }

    #[test]
    fn abi_numbers() {
        assert_eq!(SYS_READ, 0);
        assert_eq!(SYS_WRITE, 1);
        assert_eq!(SYS_OPEN, 2);
        assert_eq!(SYS_CLOSE, 3);
        assert_eq!(SYS_SCHED_YIELD, 24);
        assert_eq!(SYS_GETPID, 39);
        assert_eq!(SYS_FORK, 57);
        assert_eq!(SYS_EXECVE, 59);
        assert_eq!(SYS_EXIT, 60);
        assert_eq!(SYS_WAIT, 260);
        assert_eq!(SYS_USLEEP, 1337);
        assert_eq!(SYS_GETTIME, 1338);
        assert_eq!(SYS_CREATE_GRINCH_VM, 1339);
    }
}
