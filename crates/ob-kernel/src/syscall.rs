//! System call dispatcher
//!
//! Patched guest code reaches [`syscall_entry`] through a trampoline in the
//! module's RIP zone. The entry looks the id up in the [`SyscallTable`] and
//! reports the outcome the way FreeBSD does: a value in `rax`, with the
//! carry flag set when that value is an error.

use crate::runtime::Runtime;
use ob_core::Errno;
use thiserror::Error;

/// Number of syscall slots.
pub const TABLE_SIZE: usize = 1024;

/// Why a handler failed, as seen by the guest.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    #[error("{0}")]
    Errno(#[from] Errno),

    /// A non-errno failure value placed in `rax` as is.
    #[error("failed with 0x{0:x}")]
    Value(u64),
}

impl SyscallError {
    /// Generic failure, `-1`.
    pub const FAILED: Self = Self::Value(u64::MAX);

    pub fn retval(self) -> u64 {
        match self {
            Self::Errno(errno) => errno.as_retval(),
            Self::Value(value) => value,
        }
    }
}

pub type SyscallResult = Result<u64, SyscallError>;

/// A syscall implementation. Arguments are raw guest registers; pointers
/// among them are trusted.
pub type SyscallHandler = unsafe fn(&Runtime, [u64; 6]) -> SyscallResult;

#[derive(Clone, Copy)]
pub struct SyscallEntry {
    pub name: &'static str,
    pub handler: SyscallHandler,
}

impl std::fmt::Debug for SyscallEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyscallEntry").field("name", &self.name).finish()
    }
}

/// Fixed-size table of syscall handlers indexed by id.
#[derive(Debug)]
pub struct SyscallTable {
    entries: Vec<Option<SyscallEntry>>,
}

impl SyscallTable {
    /// A table with no handlers.
    pub fn empty() -> Self {
        Self {
            entries: vec![None; TABLE_SIZE],
        }
    }

    /// A table with every handler this kernel implements.
    pub fn new() -> Self {
        let mut table = Self::empty();
        crate::syscalls::register_all(&mut table);
        table
    }

    pub fn register(&mut self, id: u64, name: &'static str, handler: SyscallHandler) {
        match self.entries.get_mut(id as usize) {
            Some(slot) => {
                if let Some(previous) = slot {
                    tracing::warn!("Syscall {} ({}) replaced by {}", id, previous.name, name);
                }
                *slot = Some(SyscallEntry { name, handler });
            }
            None => tracing::warn!("Syscall {} ({}) is outside the table", id, name),
        }
    }

    pub fn get(&self, id: u64) -> Option<&SyscallEntry> {
        usize::try_from(id)
            .ok()
            .and_then(|id| self.entries.get(id))
            .and_then(Option::as_ref)
    }

    pub fn name(&self, id: u64) -> Option<&'static str> {
        self.get(id).map(|entry| entry.name)
    }

    /// Number of populated slots.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Host side of the syscall trampolines.
///
/// The trampoline passes the runtime pointer it finds in the module's RIP
/// pointers, the id, six guest arguments and a result slot.
#[cfg(target_arch = "x86_64")]
#[allow(clippy::too_many_arguments)]
pub extern "win64" fn syscall_entry(
    runtime: *const Runtime,
    id: u64,
    a0: u64,
    a1: u64,
    a2: u64,
    a3: u64,
    a4: u64,
    a5: u64,
    result: *mut u64,
) -> bool {
    // Safety: the runtime outlives every loaded module and the trampoline
    // always passes its own result slot.
    let (runtime, result) = unsafe {
        match (runtime.as_ref(), result.as_mut()) {
            (Some(runtime), Some(result)) => (runtime, result),
            _ => return false,
        }
    };

    match runtime.handle_syscall(id, [a0, a1, a2, a3, a4, a5]) {
        Ok(value) => {
            *result = value;
            true
        }
        Err(e) => {
            *result = e.retval();
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall_numbers::*;

    #[test]
    fn test_error_values() {
        assert_eq!(SyscallError::from(Errno::EBADF).retval(), 9);
        assert_eq!(SyscallError::FAILED.retval(), u64::MAX);
        assert_eq!(SyscallError::Value(0x800D_0203).retval(), 0x800D_0203);
    }

    #[test]
    fn test_table_lookup() {
        let table = SyscallTable::new();
        assert_eq!(table.name(SYS_GETPID), Some("getpid"));
        assert_eq!(table.name(SYS_DYNLIB_DLSYM), Some("dynlib_dlsym"));
        assert!(table.get(601).is_none());
        assert!(table.get(TABLE_SIZE as u64).is_none());
        assert!(table.get(u64::MAX).is_none());
        assert_eq!(table.len(), 57);
    }

    #[test]
    fn test_empty_table() {
        let table = SyscallTable::empty();
        assert!(table.is_empty());
        assert!(table.get(SYS_WRITE).is_none());
    }
}
