//! Guest-visible error numbers
//!
//! These follow FreeBSD numbering and are what a guest sees in `rax` when a
//! syscall returns with the carry flag set.

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Errno {
    #[error("operation not permitted")]
    EPERM = 1,
    #[error("no such file or directory")]
    ENOENT = 2,
    #[error("no such process")]
    ESRCH = 3,
    #[error("input/output error")]
    EIO = 5,
    #[error("bad file descriptor")]
    EBADF = 9,
    #[error("cannot allocate memory")]
    ENOMEM = 12,
    #[error("device busy")]
    EBUSY = 16,
    #[error("operation not supported by device")]
    ENODEV = 19,
    #[error("invalid argument")]
    EINVAL = 22,
    #[error("resource temporarily unavailable")]
    EAGAIN = 35,
    #[error("file name too long")]
    ENAMETOOLONG = 63,
    #[error("function not implemented")]
    ENOSYS = 78,
}

impl Errno {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Value stored in the syscall result slot.
    pub fn as_retval(self) -> u64 {
        self as i32 as u64
    }
}
