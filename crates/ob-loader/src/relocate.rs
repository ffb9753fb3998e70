//! Relocation arithmetic
//!
//! Pure computation of what each RELA entry stores; [`crate::Module`] looks
//! up symbol values and performs the memory writes.

use crate::elf::r_x86_64;
use ob_core::error::LinkError;

/// Store to perform at a relocation target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationWrite {
    None,
    Set64(u64),
    Set32(u32),
    Add64(u64),
    Add32(u32),
}

impl RelocationWrite {
    /// Bytes touched at the target.
    pub fn width(self) -> u64 {
        match self {
            RelocationWrite::None => 0,
            RelocationWrite::Set64(_) | RelocationWrite::Add64(_) => 8,
            RelocationWrite::Set32(_) | RelocationWrite::Add32(_) => 4,
        }
    }

    /// # Safety
    ///
    /// `target` must be valid for reads and writes of [`Self::width`] bytes.
    pub unsafe fn apply(self, target: u64) {
        match self {
            RelocationWrite::None => {}
            RelocationWrite::Set64(value) => (target as *mut u64).write_unaligned(value),
            RelocationWrite::Set32(value) => (target as *mut u32).write_unaligned(value),
            RelocationWrite::Add64(value) => {
                let ptr = target as *mut u64;
                ptr.write_unaligned(ptr.read_unaligned().wrapping_add(value));
            }
            RelocationWrite::Add32(value) => {
                let ptr = target as *mut u32;
                ptr.write_unaligned(ptr.read_unaligned().wrapping_add(value));
            }
        }
    }
}

/// True if the entry's symbol has to be looked up before applying it.
/// Types that are rejected anyway never trigger a lookup.
pub fn uses_symbol(rel_type: u32) -> bool {
    matches!(
        rel_type,
        r_x86_64::R64
            | r_x86_64::PC32
            | r_x86_64::GLOB_DAT
            | r_x86_64::DTPMOD64
            | r_x86_64::DTPOFF64
            | r_x86_64::DTPOFF32
            | r_x86_64::JUMP_SLOT
    )
}

/// Store for an entry of the main RELA table.
pub fn rela_write(
    rel_type: u32,
    symbol: u64,
    addend: i64,
    base: u64,
    target: u64,
    tls_index: u16,
) -> Result<RelocationWrite, LinkError> {
    let s_plus_a = symbol.wrapping_add(addend as u64);
    Ok(match rel_type {
        r_x86_64::NONE => RelocationWrite::None,
        r_x86_64::R64 => RelocationWrite::Set64(s_plus_a),
        r_x86_64::PC32 => RelocationWrite::Set32(s_plus_a.wrapping_sub(target) as u32),
        r_x86_64::COPY => return Err(LinkError::CopyRelocation),
        r_x86_64::GLOB_DAT => RelocationWrite::Set64(symbol),
        r_x86_64::DTPMOD64 => RelocationWrite::Add64(tls_index as u64),
        r_x86_64::DTPOFF64 => RelocationWrite::Add64(s_plus_a),
        r_x86_64::DTPOFF32 => RelocationWrite::Add32(s_plus_a as u32),
        r_x86_64::RELATIVE => RelocationWrite::Set64(base.wrapping_add(addend as u64)),
        // TPOFF64/TPOFF32 need a static TLS layout, which is not modelled.
        other => return Err(LinkError::UnsupportedRelocation(other)),
    })
}

/// Store for an entry of the PLT RELA table.
pub fn plt_write(rel_type: u32, symbol: u64, addend: i64, base: u64) -> Result<RelocationWrite, LinkError> {
    match rel_type {
        r_x86_64::JUMP_SLOT => Ok(RelocationWrite::Set64(symbol)),
        r_x86_64::RELATIVE => Ok(RelocationWrite::Set64(base.wrapping_add(addend as u64))),
        other => Err(LinkError::UnsupportedRelocation(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u64 = 0x8_0000_0000;

    #[test]
    fn test_absolute_and_relative() {
        assert_eq!(
            rela_write(r_x86_64::R64, BASE + 0x100, 8, BASE, BASE + 0x2000, 0).unwrap(),
            RelocationWrite::Set64(BASE + 0x108)
        );
        assert_eq!(
            rela_write(r_x86_64::RELATIVE, 0, 0x40, BASE, BASE + 0x2000, 0).unwrap(),
            RelocationWrite::Set64(BASE + 0x40)
        );
        assert_eq!(
            rela_write(r_x86_64::GLOB_DAT, 0xDEAD, 99, BASE, BASE, 0).unwrap(),
            RelocationWrite::Set64(0xDEAD)
        );
        assert_eq!(
            rela_write(r_x86_64::NONE, 0, 0, BASE, BASE, 0).unwrap(),
            RelocationWrite::None
        );
    }

    #[test]
    fn test_pc32_negative_distance() {
        let write = rela_write(r_x86_64::PC32, BASE + 0x1000, -4, BASE, BASE + 0x3000, 0).unwrap();
        assert_eq!(write, RelocationWrite::Set32((-0x2004i32) as u32));
    }

    #[test]
    fn test_tls_relocations() {
        assert_eq!(
            rela_write(r_x86_64::DTPMOD64, 0, 0, BASE, BASE, 3).unwrap(),
            RelocationWrite::Add64(3)
        );
        assert_eq!(
            rela_write(r_x86_64::DTPOFF32, 0x10, 0x8, BASE, BASE, 0).unwrap(),
            RelocationWrite::Add32(0x18)
        );
        assert!(matches!(
            rela_write(r_x86_64::TPOFF64, 0, 0, BASE, BASE, 0),
            Err(LinkError::UnsupportedRelocation(18))
        ));
        assert!(!uses_symbol(r_x86_64::TPOFF64));
        assert!(!uses_symbol(r_x86_64::TPOFF32));
        assert!(uses_symbol(r_x86_64::DTPOFF64));
    }

    #[test]
    fn test_rejected_types() {
        assert!(matches!(
            rela_write(r_x86_64::COPY, 0, 0, BASE, BASE, 0),
            Err(LinkError::CopyRelocation)
        ));
        assert!(rela_write(r_x86_64::JUMP_SLOT, 0, 0, BASE, BASE, 0).is_err());
        assert!(plt_write(r_x86_64::R64, 0, 0, BASE).is_err());
    }

    #[test]
    fn test_plt_entries() {
        assert_eq!(
            plt_write(r_x86_64::JUMP_SLOT, 0x1234, 16, BASE).unwrap(),
            RelocationWrite::Set64(0x1234)
        );
        assert_eq!(
            plt_write(r_x86_64::RELATIVE, 0, 0x20, BASE).unwrap(),
            RelocationWrite::Set64(BASE + 0x20)
        );
    }

    #[test]
    fn test_apply() {
        let mut words = [5u64, 0];
        let target = words.as_mut_ptr() as u64;
        unsafe {
            RelocationWrite::Add64(7).apply(target);
            RelocationWrite::Set32(0xFFFF_FFFF).apply(target + 8);
        }
        assert_eq!(words[0], 12);
        assert_eq!(words[1], 0xFFFF_FFFF);
        assert_eq!(RelocationWrite::Add32(1).width(), 4);
    }
}
