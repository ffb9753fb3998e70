//! Portable view of a faulting thread's registers

use iced_x86::Register;

pub mod eflags {
    pub const CF: u64 = 1 << 0;
    pub const ZF: u64 = 1 << 6;
    pub const SF: u64 = 1 << 7;
    pub const OF: u64 = 1 << 11;
}

/// General purpose registers in encoding order (RAX, RCX, RDX, RBX, RSP,
/// RBP, RSI, RDI, R8-R15), plus RIP and RFLAGS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct X64Context {
    pub gprs: [u64; 16],
    pub rip: u64,
    pub rflags: u64,
}

fn gpr_index(register: Register) -> Option<usize> {
    let full = register.full_register();
    full.is_gpr64().then(|| full.number())
}

impl X64Context {
    /// Value of the 64-bit register containing `register`.
    pub fn gpr(&self, register: Register) -> Option<u64> {
        gpr_index(register).map(|i| self.gprs[i])
    }

    /// Overwrite the full 64-bit register containing `register`.
    pub fn set_gpr(&mut self, register: Register, value: u64) -> bool {
        match gpr_index(register) {
            Some(i) => {
                self.gprs[i] = value;
                true
            }
            None => false,
        }
    }

    pub fn flag(&self, flag: u64) -> bool {
        self.rflags & flag != 0
    }

    /// Replace CF, ZF, SF and OF; other flags are kept.
    pub fn set_status_flags(&mut self, cf: bool, zf: bool, sf: bool, of: bool) {
        use eflags::*;
        let mut rflags = self.rflags & !(CF | ZF | SF | OF);
        for (set, bit) in [(cf, CF), (zf, ZF), (sf, SF), (of, OF)] {
            if set {
                rflags |= bit;
            }
        }
        self.rflags = rflags;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sub_registers_map_to_full_register() {
        let mut context = X64Context::default();
        assert!(context.set_gpr(Register::R10D, 7));
        assert_eq!(context.gprs[10], 7);
        assert_eq!(context.gpr(Register::R10), Some(7));
        assert_eq!(context.gpr(Register::EBX), Some(0));
        assert!(!context.set_gpr(Register::XMM0, 1));
    }

    #[test]
    fn test_status_flags_keep_others() {
        let mut context = X64Context {
            rflags: 0x202 | eflags::CF,
            ..Default::default()
        };
        context.set_status_flags(false, true, false, true);
        assert_eq!(context.rflags, 0x202 | eflags::ZF | eflags::OF);
    }
}
