//! Software BMI1
//!
//! ANDN, BEXTR, BLSI and BLSR applied to an [`X64Context`]. Memory operands
//! are read straight from the faulting process.

use super::context::X64Context;
use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic, OpKind, Register};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EmulationError {
    #[error("Invalid instruction at 0x{0:x}")]
    Invalid(u64),

    #[error("{0:?} is not emulated")]
    Unsupported(Mnemonic),

    #[error("Unsupported operand {1:?} of {0:?}")]
    Operand(Mnemonic, OpKind),

    #[error("Segment override on memory operand at 0x{0:x}")]
    SegmentOverride(u64),
}

/// Width of the destination, in bits.
fn operand_bits(insn: &Instruction) -> u32 {
    if insn.op0_register().size() == 4 {
        32
    } else {
        64
    }
}

fn mask(bits: u32) -> u64 {
    if bits == 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

fn memory_address(context: &X64Context, insn: &Instruction) -> Result<u64, EmulationError> {
    if insn.segment_prefix() != Register::None {
        return Err(EmulationError::SegmentOverride(insn.ip()));
    }
    if insn.is_ip_rel_memory_operand() {
        return Ok(insn.ip_rel_memory_address());
    }

    let base = match insn.memory_base() {
        Register::None => 0,
        register => context.gpr(register).unwrap_or(0),
    };
    let index = match insn.memory_index() {
        Register::None => 0,
        register => context.gpr(register).unwrap_or(0),
    };
    Ok(base
        .wrapping_add(index.wrapping_mul(insn.memory_index_scale() as u64))
        .wrapping_add(insn.memory_displacement64()))
}

/// Read operand `operand` at the destination width.
fn read_operand(context: &X64Context, insn: &Instruction, operand: u32, bits: u32) -> Result<u64, EmulationError> {
    match insn.op_kind(operand) {
        OpKind::Register => {
            let register = insn.op_register(operand);
            let value = context
                .gpr(register)
                .ok_or(EmulationError::Operand(insn.mnemonic(), OpKind::Register))?;
            Ok(value & mask(bits))
        }
        OpKind::Memory => {
            let address = memory_address(context, insn)?;
            // Safety: the faulting instruction would have read the same
            // address.
            let value = unsafe {
                if bits == 32 {
                    std::ptr::read_unaligned(address as *const u32) as u64
                } else {
                    std::ptr::read_unaligned(address as *const u64)
                }
            };
            Ok(value)
        }
        kind => Err(EmulationError::Operand(insn.mnemonic(), kind)),
    }
}

fn bextr(source: u64, control: u64, bits: u32) -> u64 {
    let start = (control & 0xFF) as u32;
    let len = ((control >> 8) & 0xFF) as u32;
    if start >= bits {
        return 0;
    }
    let value = source >> start;
    if len >= bits {
        value
    } else {
        value & mask(len)
    }
}

/// Decode the instruction at `context.rip` from `code` and apply it.
/// Advances RIP on success.
pub fn emulate(context: &mut X64Context, code: &[u8]) -> Result<Mnemonic, EmulationError> {
    let mut decoder = Decoder::with_ip(64, code, context.rip, DecoderOptions::NONE);
    let insn = decoder.decode();
    if insn.is_invalid() {
        return Err(EmulationError::Invalid(context.rip));
    }

    let mnemonic = insn.mnemonic();
    let bits = operand_bits(&insn);
    let sign = 1u64 << (bits - 1);

    let (result, cf, sf) = match mnemonic {
        Mnemonic::Andn => {
            let first = read_operand(context, &insn, 1, bits)?;
            let second = read_operand(context, &insn, 2, bits)?;
            let result = !first & second & mask(bits);
            (result, false, result & sign != 0)
        }
        Mnemonic::Bextr => {
            let source = read_operand(context, &insn, 1, bits)?;
            let control = read_operand(context, &insn, 2, bits)?;
            (bextr(source, control, bits), false, false)
        }
        Mnemonic::Blsi => {
            let source = read_operand(context, &insn, 1, bits)?;
            let result = source.wrapping_neg() & source & mask(bits);
            (result, source != 0, result & sign != 0)
        }
        Mnemonic::Blsr => {
            let source = read_operand(context, &insn, 1, bits)?;
            let result = source.wrapping_sub(1) & source & mask(bits);
            (result, source == 0, result & sign != 0)
        }
        _ => return Err(EmulationError::Unsupported(mnemonic)),
    };

    // 32-bit results zero-extend.
    if !context.set_gpr(insn.op0_register(), result) {
        return Err(EmulationError::Operand(mnemonic, insn.op0_kind()));
    }
    context.set_status_flags(cf, result == 0, sf, false);
    context.rip = insn.next_ip();
    Ok(mnemonic)
}
