//! Named shared memory (shm_open)

use super::{MapRequest, ObjectOps};
use crate::memory::{map_flags, prot};
use ob_core::Errno;
use ob_memory::{PageFlags, SharedSection};
use parking_lot::Mutex;

#[derive(Debug)]
pub struct SharedMemory {
    path: String,
    flags: u32,
    mode: u32,
    section: Mutex<Option<SharedSection>>,
}

impl SharedMemory {
    /// An empty segment; it has no backing until the first truncate.
    pub fn new(path: &str, flags: u32, mode: u32) -> Self {
        Self {
            path: path.to_string(),
            flags,
            mode,
            section: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn len(&self) -> u64 {
        self.section.lock().as_ref().map_or(0, SharedSection::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn page_flags(protection: u32) -> PageFlags {
    match protection & (prot::READ | prot::WRITE | prot::EXEC) {
        prot::READ => PageFlags::READ,
        _ => PageFlags::RW,
    }
}

impl ObjectOps for SharedMemory {
    fn close(&self) -> Result<(), Errno> {
        Ok(())
    }

    fn truncate(&self, length: u64) -> Result<(), Errno> {
        let mut section = self.section.lock();
        let next = match section.as_ref() {
            Some(current) => current.resized(length),
            None => SharedSection::new(length),
        }
        .map_err(|e| {
            tracing::warn!("Failed to size shared memory {} to 0x{:x}: {}", self.path, length, e);
            Errno::ENOMEM
        })?;
        *section = Some(next);
        Ok(())
    }

    fn mmap(&self, request: &MapRequest) -> Result<u64, Errno> {
        let section = self.section.lock();
        let section = section.as_ref().ok_or(Errno::EINVAL)?;
        if request.len == 0 || request.offset.saturating_add(request.len) > section.len() {
            return Err(Errno::EINVAL);
        }

        let addr = match request.addr {
            0 => None,
            addr if request.flags & map_flags::FIXED != 0 => Some(addr),
            _ => None,
        };
        section
            .map_view(addr, request.len, request.offset, page_flags(request.prot))
            .map_err(|_| Errno::ENOMEM)
    }
}
