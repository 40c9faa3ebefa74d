//! Kernel error codes.
//!
//! Errors travel as `Result<T, Errno>` inside the kernel and as negative
//! errno values in the return register at the syscall boundary. The numeric
//! values follow POSIX.

use core::fmt;

/// Kernel-wide result type.
pub type Result<T> = core::result::Result<T, Errno>;

/// POSIX-style error codes.
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Errno {
    /// Operation not permitted.
    EPERM = 1,
    /// No such file or directory.
    ENOENT = 2,
    /// I/O error.
    EIO = 5,
    /// Argument list too long.
    E2BIG = 7,
    /// Bad file descriptor.
    EBADF = 9,
    /// No child processes.
    ECHILD = 10,
    /// Try again.
    EAGAIN = 11,
    /// Out of memory.
    ENOMEM = 12,
    /// Bad address.
    EFAULT = 14,
    /// Device or resource busy.
    EBUSY = 16,
    /// File exists.
    EEXIST = 17,
    /// No such device.
    ENODEV = 19,
    /// Not a directory.
    ENOTDIR = 20,
    /// Is a directory.
    EISDIR = 21,
    /// Invalid argument.
    EINVAL = 22,
    /// Read-only file system.
    EROFS = 30,
    /// Result out of range.
    ERANGE = 34,
    /// Function not implemented.
    ENOSYS = 38,
    /// File name too long.
    ENAMETOOLONG = 78,
    /// Message too long.
    EMSGSIZE = 97,
}

impl Errno {
    /// Returns the negative register encoding of this error.
    pub const fn as_neg(self) -> isize {
        -(self as i32 as isize)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-{:?}", self)
    }
}

/// Folds a kernel result into the syscall register encoding.
pub fn to_sysret(res: Result<isize>) -> isize {
    match res {
        Ok(v) => v,
        Err(e) => e.as_neg(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_values() {
        assert_eq!(Errno::ENOENT as i32, 2);
        assert_eq!(Errno::E2BIG as i32, 7);
        assert_eq!(Errno::ECHILD as i32, 10);
        assert_eq!(Errno::EFAULT as i32, 14);
        assert_eq!(Errno::ENOSYS as i32, 38);
        assert_eq!(Errno::EMSGSIZE as i32, 97);
        assert_eq!(Errno::ENOMEM.as_neg(), -12);
        assert_eq!(to_sysret(Err(Errno::EINVAL)), -22);
        assert_eq!(to_sysret(Ok(7)), 7);
    }
}
