//! Guest memory allocation
//!
//! Guest allocations are plain host mappings that live until the process
//! exits; `munmap` is accepted but never returns memory to the host.

use ob_core::Errno;
use ob_memory::{align_up, PageFlags, Reservation, GUEST_PAGE_SIZE};

/// `mmap` flag bits
pub mod map_flags {
    pub const SHARED: u32 = 0x1;
    pub const PRIVATE: u32 = 0x2;
    pub const FIXED: u32 = 0x10;
    pub const HASSEMAPHORE: u32 = 0x200;
    pub const VOID: u32 = 0x100;
    pub const STACK: u32 = 0x400;
    pub const ANONYMOUS: u32 = 0x1000;
    pub const SYSTEM: u32 = 0x2000;

    /// Flags the `mmap` syscall accepts.
    pub const SUPPORTED: u32 = SHARED | PRIVATE | FIXED | VOID | STACK | ANONYMOUS | SYSTEM;
}

/// `mmap` protection bits
pub mod prot {
    pub const READ: u32 = 0x1;
    pub const WRITE: u32 = 0x2;
    pub const EXEC: u32 = 0x4;
}

/// Map `len` bytes of zeroed read/write memory at `addr`, or anywhere when
/// `addr` is zero or taken and the mapping is not fixed.
pub fn allocate_anonymous(addr: u64, len: u64, fixed: bool) -> Result<u64, Errno> {
    if len == 0 {
        return Err(Errno::EINVAL);
    }
    let size = align_up(len, GUEST_PAGE_SIZE);

    let reservation = match addr {
        0 => Reservation::new(size),
        _ => match Reservation::at(addr, size) {
            Ok(reservation) => Ok(reservation),
            Err(_) if !fixed => Reservation::new(size),
            Err(e) => Err(e),
        },
    }
    .map_err(|e| {
        tracing::debug!("Guest allocation of 0x{:x} bytes failed: {}", size, e);
        Errno::ENOMEM
    })?;

    reservation
        .commit(reservation.base(), size, PageFlags::RW)
        .map_err(|_| Errno::ENOMEM)?;
    Ok(reservation.into_raw())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_anywhere() {
        let addr = allocate_anonymous(0, 0x100, false).unwrap();
        assert_ne!(addr, 0);
        assert_eq!(addr % 0x1000, 0);
        unsafe {
            let bytes = std::slice::from_raw_parts_mut(addr as *mut u8, 0x100);
            assert!(bytes.iter().all(|&b| b == 0));
            bytes[0] = 0x5A;
        }
    }

    #[test]
    fn test_zero_length_rejected() {
        assert_eq!(allocate_anonymous(0, 0, false), Err(Errno::EINVAL));
    }

    #[test]
    fn test_supported_flags() {
        assert_eq!(map_flags::SUPPORTED, 0x3513);
        assert_eq!(map_flags::SUPPORTED & map_flags::HASSEMAPHORE, 0);
    }
}
