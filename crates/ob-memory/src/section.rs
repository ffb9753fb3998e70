//! Anonymous shared sections
//!
//! Guest shared memory is backed by an unnamed host section that can be
//! mapped several times. Views are not owned by the section; they stay mapped
//! until [`SharedSection::unmap_view`] is called.

use crate::pages::PageFlags;
use ob_core::error::MemoryError;

#[derive(Debug)]
pub struct SharedSection {
    handle: native::Handle,
    len: u64,
}

// Safety: the native handle is a file descriptor or section handle, both of
// which may be used from any thread.
unsafe impl Send for SharedSection {}
unsafe impl Sync for SharedSection {}

impl SharedSection {
    /// Create a zero-filled section of `len` bytes.
    pub fn new(len: u64) -> Result<Self, MemoryError> {
        let handle = native::create(len)?;
        Ok(Self { handle, len })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Map `len` bytes starting at `offset`, at `addr` if given.
    pub fn map_view(
        &self,
        addr: Option<u64>,
        len: u64,
        offset: u64,
        flags: PageFlags,
    ) -> Result<u64, MemoryError> {
        native::map(&self.handle, addr, len, offset, flags)
    }

    pub fn unmap_view(addr: u64, len: u64) {
        native::unmap(addr, len);
    }

    /// Build a new section of `new_len` bytes holding the first
    /// `min(old, new)` bytes of this one.
    pub fn resized(&self, new_len: u64) -> Result<Self, MemoryError> {
        let next = Self::new(new_len)?;
        let keep = self.len.min(new_len);
        if keep > 0 {
            let src = self.map_view(None, keep, 0, PageFlags::READ)?;
            let dst = match next.map_view(None, keep, 0, PageFlags::RW) {
                Ok(dst) => dst,
                Err(e) => {
                    Self::unmap_view(src, keep);
                    return Err(e);
                }
            };
            unsafe {
                std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, keep as usize);
            }
            Self::unmap_view(dst, keep);
            Self::unmap_view(src, keep);
        }
        Ok(next)
    }
}

impl Drop for SharedSection {
    fn drop(&mut self) {
        native::close(&self.handle);
    }
}

#[cfg(unix)]
mod native {
    use crate::pages::PageFlags;
    use ob_core::error::MemoryError;

    pub type Handle = libc::c_int;

    #[cfg(target_os = "linux")]
    fn anonymous_fd() -> libc::c_int {
        unsafe { libc::memfd_create(c"oxidized-orbis-shm".as_ptr(), libc::MFD_CLOEXEC) }
    }

    #[cfg(not(target_os = "linux"))]
    fn anonymous_fd() -> libc::c_int {
        use std::sync::atomic::{AtomicU32, Ordering};
        static NEXT: AtomicU32 = AtomicU32::new(0);

        let name = format!(
            "/oxidized-orbis-{}-{}\0",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        );
        let name = name.as_ptr() as *const libc::c_char;
        unsafe {
            let fd = libc::shm_open(name, libc::O_RDWR | libc::O_CREAT | libc::O_EXCL, 0o600);
            if fd >= 0 {
                libc::shm_unlink(name);
            }
            fd
        }
    }

    pub fn create(len: u64) -> Result<Handle, MemoryError> {
        let fd = anonymous_fd();
        if fd < 0 {
            return Err(MemoryError::OutOfMemory);
        }
        if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
            unsafe { libc::close(fd) };
            return Err(MemoryError::OutOfMemory);
        }
        Ok(fd)
    }

    pub fn map(
        fd: &Handle,
        addr: Option<u64>,
        len: u64,
        offset: u64,
        flags: PageFlags,
    ) -> Result<u64, MemoryError> {
        let mut map_flags = libc::MAP_SHARED;
        if addr.is_some() {
            map_flags |= libc::MAP_FIXED;
        }
        let ptr = unsafe {
            libc::mmap(
                addr.unwrap_or(0) as *mut libc::c_void,
                len as usize,
                flags.to_native(),
                map_flags,
                *fd,
                offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::OutOfMemory);
        }
        Ok(ptr as u64)
    }

    pub fn unmap(addr: u64, len: u64) {
        unsafe {
            libc::munmap(addr as *mut libc::c_void, len as usize);
        }
    }

    pub fn close(fd: &Handle) {
        unsafe {
            libc::close(*fd);
        }
    }
}

#[cfg(windows)]
mod native {
    use crate::pages::PageFlags;
    use ob_core::error::MemoryError;
    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
    use windows_sys::Win32::System::Memory::*;

    pub type Handle = HANDLE;

    pub fn create(len: u64) -> Result<Handle, MemoryError> {
        let handle = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                std::ptr::null(),
                PAGE_READWRITE | SEC_COMMIT,
                (len >> 32) as u32,
                len as u32,
                std::ptr::null(),
            )
        };
        if handle == 0 {
            return Err(MemoryError::OutOfMemory);
        }
        Ok(handle)
    }

    pub fn map(
        handle: &Handle,
        addr: Option<u64>,
        len: u64,
        offset: u64,
        flags: PageFlags,
    ) -> Result<u64, MemoryError> {
        let access = if flags.contains(PageFlags::WRITE) {
            FILE_MAP_READ | FILE_MAP_WRITE
        } else {
            FILE_MAP_READ
        };
        let view = unsafe {
            MapViewOfFileEx(
                *handle,
                access,
                (offset >> 32) as u32,
                offset as u32,
                len as usize,
                addr.unwrap_or(0) as *const core::ffi::c_void,
            )
        };
        if view.Value.is_null() {
            return Err(MemoryError::OutOfMemory);
        }
        Ok(view.Value as u64)
    }

    pub fn unmap(addr: u64, _len: u64) {
        unsafe {
            UnmapViewOfFile(MEMORY_MAPPED_VIEW_ADDRESS {
                Value: addr as *mut core::ffi::c_void,
            });
        }
    }

    pub fn close(handle: &Handle) {
        unsafe {
            CloseHandle(*handle);
        }
    }
}
