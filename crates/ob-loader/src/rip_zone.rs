//! RIP-addressable scratch area
//!
//! Every module carries a small executable arena within a signed 32-bit
//! displacement of its text. The arena starts with a [`RipPointers`] cell
//! followed by guard pages and the bump-allocated trampoline space.

use ob_core::error::PatchError;
use ob_memory::{align_up, GUEST_PAGE_SIZE};
use std::sync::atomic::AtomicU64;

/// Size of the bump-allocated trampoline arena.
pub const FREE_ZONE_SIZE: u64 = 32 * 1024 * 1024;

/// Offset of the trampoline arena from the start of the zone.
pub const FREE_ZONE_OFFSET: u64 = RIP_POINTERS_PAGE_SIZE + GUEST_PAGE_SIZE;

/// Space reserved for the pointer cell.
pub const RIP_POINTERS_PAGE_SIZE: u64 = GUEST_PAGE_SIZE;

/// Full footprint: pointer page, guard, arena, guard.
pub const RIP_ZONE_SIZE: u64 = FREE_ZONE_OFFSET + FREE_ZONE_SIZE + GUEST_PAGE_SIZE;

/// Alignment of each emitted trampoline.
pub const TRAMPOLINE_ALIGN: u64 = 32;

/// Per-module values read by emitted code through RIP-relative loads.
/// Guest threads read these concurrently, hence the atomics.
#[derive(Debug, Default)]
#[repr(C, align(16))]
pub struct RipPointers {
    pub fsbase: AtomicU64,
    pub runtime: AtomicU64,
    pub syscall_handler: AtomicU64,
}

impl RipPointers {
    pub const FSBASE_OFFSET: u8 = 0;
    pub const RUNTIME_OFFSET: u8 = 8;
    pub const SYSCALL_HANDLER_OFFSET: u8 = 16;
}

/// Trailer of every trampoline: where to resume and which pointer cell to
/// use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Tail {
    pub target: u64,
    pub rip_pointers: u64,
}

impl Tail {
    pub const SIZE: usize = 16;
    pub const TARGET_OFFSET: usize = 0;
    pub const RIP_POINTERS_OFFSET: usize = 8;
}

/// Bump allocator over committed RWX memory. Nothing is ever freed; the
/// arena lives and dies with its module's reservation.
#[derive(Debug)]
pub struct RipZone {
    base: u64,
    cursor: u64,
    end: u64,
}

impl RipZone {
    /// # Safety
    ///
    /// `[base, base + size)` must be committed, writable memory that stays
    /// mapped for the lifetime of the zone.
    pub unsafe fn new(base: u64, size: u64) -> Self {
        Self {
            base,
            cursor: base,
            end: base + size,
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn used(&self) -> u64 {
        self.cursor - self.base
    }

    /// Hand out `size` bytes, or `None` once the arena is exhausted.
    pub fn take(&mut self, size: u64) -> Option<u64> {
        if size > self.end - self.cursor {
            return None;
        }
        let address = self.cursor;
        self.cursor += size;
        Some(address)
    }

    /// Copy `code` into a fresh 32-byte aligned slot, pad the slot with
    /// `int3` and fill the trailing [`Tail`].
    pub fn emit(&mut self, code: &[u8], tail: Tail) -> Result<u64, PatchError> {
        debug_assert!(code.len() >= Tail::SIZE);
        let aligned = align_up(code.len() as u64, TRAMPOLINE_ALIGN);
        let address = self.take(aligned).ok_or(PatchError::RipZoneExhausted)?;

        // Safety: `take` only returns ranges inside the committed arena.
        unsafe {
            let dst = std::slice::from_raw_parts_mut(address as *mut u8, aligned as usize);
            dst[..code.len()].copy_from_slice(code);
            dst[code.len()..].fill(0xCC);
            let tail_start = code.len() - Tail::SIZE;
            dst[tail_start..tail_start + 8].copy_from_slice(&tail.target.to_le_bytes());
            dst[tail_start + 8..tail_start + 16].copy_from_slice(&tail.rip_pointers.to_le_bytes());
        }
        Ok(address)
    }
}
