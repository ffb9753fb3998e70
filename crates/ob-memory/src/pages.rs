//! Page flags and alignment helpers

use bitflags::bitflags;

/// Orbis segment and allocation granularity (16 KiB).
pub const GUEST_PAGE_SIZE: u64 = 0x4000;

bitflags! {
    /// Page protection flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u32 {
        /// Page is readable
        const READ    = 0b0000_0001;
        /// Page is writable
        const WRITE   = 0b0000_0010;
        /// Page is executable
        const EXECUTE = 0b0000_0100;

        /// Read and write access
        const RW  = Self::READ.bits() | Self::WRITE.bits();
        /// Read, write, and execute access
        const RWX = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
        /// Read and execute access
        const RX  = Self::READ.bits() | Self::EXECUTE.bits();
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        Self::empty()
    }
}

impl PageFlags {
    /// Translate ELF `p_flags` (PF_X = 1, PF_W = 2, PF_R = 4).
    pub fn from_elf(p_flags: u32) -> Self {
        let mut flags = Self::empty();
        if p_flags & 4 != 0 {
            flags |= Self::READ;
        }
        if p_flags & 2 != 0 {
            flags |= Self::WRITE;
        }
        if p_flags & 1 != 0 {
            flags |= Self::EXECUTE;
        }
        flags
    }

    /// Translate guest `PROT_*` bits, which share the host's numbering.
    pub fn from_prot(prot: u32) -> Self {
        Self::from_bits_truncate(prot & 7)
    }

    #[cfg(unix)]
    pub(crate) fn to_native(self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.contains(Self::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(Self::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.contains(Self::EXECUTE) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }

    #[cfg(windows)]
    pub(crate) fn to_native(self) -> u32 {
        use windows_sys::Win32::System::Memory::*;

        let exec = self.contains(Self::EXECUTE);
        if self.contains(Self::WRITE) {
            if exec {
                PAGE_EXECUTE_READWRITE
            } else {
                PAGE_READWRITE
            }
        } else if self.contains(Self::READ) {
            if exec {
                PAGE_EXECUTE_READ
            } else {
                PAGE_READONLY
            }
        } else if exec {
            PAGE_EXECUTE
        } else {
            PAGE_NOACCESS
        }
    }
}

/// Round `value` up to a multiple of `align` (a power of two).
pub fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Round `value` down to a multiple of `align` (a power of two).
pub fn align_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

pub fn is_aligned(value: u64, align: u64) -> bool {
    value & (align - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_flags() {
        let flags = PageFlags::RW;
        assert!(flags.contains(PageFlags::READ));
        assert!(flags.contains(PageFlags::WRITE));
        assert!(!flags.contains(PageFlags::EXECUTE));
    }

    #[test]
    fn test_from_elf() {
        assert_eq!(PageFlags::from_elf(5), PageFlags::RX);
        assert_eq!(PageFlags::from_elf(6), PageFlags::RW);
        assert_eq!(PageFlags::from_elf(7), PageFlags::RWX);
        assert_eq!(PageFlags::from_elf(0), PageFlags::empty());
    }

    #[test]
    fn test_alignment() {
        assert_eq!(align_up(0x4001, GUEST_PAGE_SIZE), 0x8000);
        assert_eq!(align_up(0x4000, GUEST_PAGE_SIZE), 0x4000);
        assert_eq!(align_down(0x7FFF, GUEST_PAGE_SIZE), 0x4000);
        assert!(is_aligned(0x1_0000_0000, 0x1_0000_0000));
        assert!(!is_aligned(0x2000, GUEST_PAGE_SIZE));
    }
}
