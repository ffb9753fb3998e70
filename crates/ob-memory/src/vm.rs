//! Reserved address ranges
//!
//! A [`Reservation`] owns a span of host address space. It starts with no
//! access; sub-ranges are committed and re-protected as the loader needs them,
//! and the whole span is released when the reservation drops.

use crate::pages::PageFlags;
use ob_core::error::MemoryError;

/// Owned host address range.
#[derive(Debug)]
pub struct Reservation {
    base: u64,
    size: u64,
}

// Safety: the reservation is a plain address range; access to the memory
// behind it is coordinated by its owner.
unsafe impl Send for Reservation {}
unsafe impl Sync for Reservation {}

impl Reservation {
    /// Reserve `size` bytes anywhere in the address space.
    pub fn new(size: u64) -> Result<Self, MemoryError> {
        let base = native::reserve(None, size)?;
        Ok(Self { base, size })
    }

    /// Reserve `size` bytes at `addr`. Fails rather than moving or clobbering
    /// an existing mapping.
    pub fn at(addr: u64, size: u64) -> Result<Self, MemoryError> {
        let base = native::reserve(Some(addr), size)?;
        if base != addr {
            native::release(base, size);
            return Err(MemoryError::ReserveFailed { size });
        }
        Ok(Self { base, size })
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn end(&self) -> u64 {
        self.base + self.size
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.base as *mut u8
    }

    pub fn contains(&self, addr: u64, size: u64) -> bool {
        addr >= self.base && size <= self.size && addr - self.base <= self.size - size
    }

    /// Make `[addr, addr+size)` usable with `flags`. Freshly committed memory
    /// reads as zero.
    pub fn commit(&self, addr: u64, size: u64, flags: PageFlags) -> Result<(), MemoryError> {
        self.check(addr, size)?;
        native::commit(addr, size, flags)
    }

    /// Change the protection of an already committed range.
    pub fn protect(&self, addr: u64, size: u64, flags: PageFlags) -> Result<(), MemoryError> {
        self.check(addr, size)?;
        native::protect(addr, size, flags)
    }

    /// Give up ownership without releasing; the range stays mapped for the
    /// rest of the process.
    pub fn into_raw(self) -> u64 {
        let base = self.base;
        std::mem::forget(self);
        base
    }

    fn check(&self, addr: u64, size: u64) -> Result<(), MemoryError> {
        if self.contains(addr, size) {
            Ok(())
        } else {
            Err(MemoryError::OutOfRange { addr, size })
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        tracing::trace!("Releasing 0x{:x} bytes at 0x{:016x}", self.size, self.base);
        native::release(self.base, self.size);
    }
}

#[cfg(unix)]
mod native {
    use crate::pages::PageFlags;
    use ob_core::error::MemoryError;

    pub fn reserve(hint: Option<u64>, size: u64) -> Result<u64, MemoryError> {
        let addr = hint.unwrap_or(0) as *mut libc::c_void;
        let ptr = unsafe {
            libc::mmap(
                addr,
                size as usize,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::ReserveFailed { size });
        }

        Ok(ptr as u64)
    }

    pub fn commit(addr: u64, size: u64, flags: PageFlags) -> Result<(), MemoryError> {
        // Anonymous pages are materialized zero-filled on first touch.
        let result =
            unsafe { libc::mprotect(addr as *mut libc::c_void, size as usize, flags.to_native()) };
        if result != 0 {
            return Err(MemoryError::CommitFailed { addr, size });
        }
        Ok(())
    }

    pub fn protect(addr: u64, size: u64, flags: PageFlags) -> Result<(), MemoryError> {
        let result =
            unsafe { libc::mprotect(addr as *mut libc::c_void, size as usize, flags.to_native()) };
        if result != 0 {
            return Err(MemoryError::ProtectFailed { addr, size });
        }
        Ok(())
    }

    pub fn release(addr: u64, size: u64) {
        unsafe {
            libc::munmap(addr as *mut libc::c_void, size as usize);
        }
    }
}

#[cfg(windows)]
mod native {
    use crate::pages::PageFlags;
    use ob_core::error::MemoryError;
    use windows_sys::Win32::System::Memory::*;

    pub fn reserve(hint: Option<u64>, size: u64) -> Result<u64, MemoryError> {
        let addr = hint.unwrap_or(0) as *const core::ffi::c_void;
        let ptr = unsafe { VirtualAlloc(addr, size as usize, MEM_RESERVE, PAGE_NOACCESS) };

        if ptr.is_null() {
            return Err(MemoryError::ReserveFailed { size });
        }

        Ok(ptr as u64)
    }

    pub fn commit(addr: u64, size: u64, flags: PageFlags) -> Result<(), MemoryError> {
        let ptr = unsafe {
            VirtualAlloc(
                addr as *const core::ffi::c_void,
                size as usize,
                MEM_COMMIT,
                flags.to_native(),
            )
        };
        if ptr.is_null() {
            return Err(MemoryError::CommitFailed { addr, size });
        }
        Ok(())
    }

    pub fn protect(addr: u64, size: u64, flags: PageFlags) -> Result<(), MemoryError> {
        let mut old = 0;
        let ok = unsafe {
            VirtualProtect(
                addr as *const core::ffi::c_void,
                size as usize,
                flags.to_native(),
                &mut old,
            )
        };
        if ok == 0 {
            return Err(MemoryError::ProtectFailed { addr, size });
        }
        Ok(())
    }

    pub fn release(addr: u64, _size: u64) {
        unsafe {
            VirtualFree(addr as *mut core::ffi::c_void, 0, MEM_RELEASE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pages::GUEST_PAGE_SIZE;

    #[test]
    fn test_reserve_commit_write() {
        let res = Reservation::new(4 * GUEST_PAGE_SIZE).unwrap();
        let addr = res.base() + GUEST_PAGE_SIZE;
        res.commit(addr, GUEST_PAGE_SIZE, PageFlags::RW).unwrap();

        let slice =
            unsafe { std::slice::from_raw_parts_mut(addr as *mut u8, GUEST_PAGE_SIZE as usize) };
        assert!(slice.iter().all(|&b| b == 0));
        slice[0] = 0xAB;
        assert_eq!(slice[0], 0xAB);

        res.protect(addr, GUEST_PAGE_SIZE, PageFlags::READ).unwrap();
        assert_eq!(slice[0], 0xAB);
    }

    #[test]
    fn test_out_of_range() {
        let res = Reservation::new(GUEST_PAGE_SIZE).unwrap();
        let err = res
            .commit(res.base() + GUEST_PAGE_SIZE, GUEST_PAGE_SIZE, PageFlags::RW)
            .unwrap_err();
        assert!(matches!(err, MemoryError::OutOfRange { .. }));
        assert!(res.contains(res.base(), GUEST_PAGE_SIZE));
        assert!(!res.contains(res.base() - 1, 1));
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_large_reservation() {
        let res = Reservation::new(8 << 30).unwrap();
        assert_eq!(res.size(), 8 << 30);
        assert_eq!(res.end() - res.base(), 8 << 30);
    }
}
