//! Text analysis and patching
//!
//! Walks the code slice of a module and redirects everything the host cannot
//! run as-is: `syscall` sites jump into syscall trampolines, `fs:` loads jump
//! into fs-base trampolines and `int n` becomes `ud2` so the exception hook
//! sees it.

use crate::codegen::{self, FsBaseMode, Gpr, Trampoline};
use crate::pattern::{self, ANY};
use crate::rip_zone::{RipZone, Tail};
use iced_x86::{Code, Decoder, DecoderOptions, Instruction, Mnemonic, OpKind, Register};
use ob_core::error::PatchError;
use std::collections::BTreeMap;
use std::ops::Range;
use tracing::{debug, trace};

/// `mov r10, rcx; syscall`
const SYSCALL_SITE: [u16; 5] = [0x49, 0x89, 0xCA, 0x0F, 0x05];

/// `mov rax, imm32; syscall`
const NAKED_SYSCALL_SITE: [u16; 9] = [0x48, 0xC7, 0xC0, ANY, ANY, ANY, ANY, 0x0F, 0x05];

const JMP_REL32_SIZE: usize = 5;

/// Everything the patcher needs from the module being patched.
pub struct PatchTarget<'a> {
    /// Address of the pointer cell stored in every trampoline tail.
    pub rip_pointers: u64,
    pub zone: &'a mut RipZone,
    pub fs_mode: FsBaseMode,
    /// Host BMI1 support. Without it BMI1 instructions are left to trap.
    pub host_has_bmi1: bool,
    /// Patched `int n` sites, keyed by address.
    pub interrupts: &'a mut BTreeMap<u64, u8>,
}

/// Number of sites rewritten per kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchStats {
    pub syscalls: usize,
    pub naked_syscalls: usize,
    pub interrupts: usize,
    pub fs_accesses: usize,
    pub bmi1_left_in_place: usize,
}

fn is_bmi1(mnemonic: Mnemonic) -> bool {
    matches!(
        mnemonic,
        Mnemonic::Andn
            | Mnemonic::Bextr
            | Mnemonic::Blsi
            | Mnemonic::Blsmsk
            | Mnemonic::Blsr
            | Mnemonic::Tzcnt
    )
}

/// Explicit segment override on a memory operand, if any.
fn memory_segment_override(insn: &Instruction) -> Option<Register> {
    let has_memory = (0..insn.op_count()).any(|i| insn.op_kind(i) == OpKind::Memory);
    match insn.segment_prefix() {
        Register::None => None,
        segment if has_memory => Some(segment),
        _ => None,
    }
}

/// Overwrite `len` bytes at `site` with a jump to `destination`, filling the
/// rest with `int3`.
fn write_jump(buffer: &mut [u8], offset: usize, site: u64, len: usize, destination: u64) -> Result<(), PatchError> {
    if len < JMP_REL32_SIZE {
        return Err(PatchError::SiteTooShort { addr: site, len });
    }
    let rel = destination as i64 - (site + JMP_REL32_SIZE as u64) as i64;
    let rel = i32::try_from(rel).map_err(|_| PatchError::OutOfReach(destination))?;

    let bytes = &mut buffer[offset..offset + len];
    bytes[0] = 0xE9;
    bytes[1..5].copy_from_slice(&rel.to_le_bytes());
    bytes[5..].fill(0xCC);
    Ok(())
}

struct Patcher<'a, 'b> {
    buffer: &'a mut [u8],
    address: u64,
    target: &'a mut PatchTarget<'b>,
    stats: PatchStats,
}

impl Patcher<'_, '_> {
    fn redirect(&mut self, offset: usize, len: usize, trampoline: Trampoline) -> Result<(), PatchError> {
        let site = self.address + offset as u64;
        let tail = Tail {
            target: site + len as u64,
            rip_pointers: self.target.rip_pointers,
        };
        let code = self.target.zone.emit(trampoline.code(), tail)?;
        write_jump(self.buffer, offset, site, len, code)?;
        trace!("Patched 0x{:016x} ({} bytes) -> 0x{:016x}", site, len, code);
        Ok(())
    }

    fn syscall(&mut self, snapshot: &[u8], offset: usize) -> Result<(), PatchError> {
        let plain_start = offset.checked_sub(SYSCALL_SITE.len() - 2);
        if let Some(start) = plain_start.filter(|&s| pattern::matches_at(&snapshot[s..], &SYSCALL_SITE)) {
            self.stats.syscalls += 1;
            return self.redirect(start, SYSCALL_SITE.len(), codegen::syscall_trampoline());
        }

        let naked_start = offset.checked_sub(NAKED_SYSCALL_SITE.len() - 2);
        if let Some(start) = naked_start.filter(|&s| pattern::matches_at(&snapshot[s..], &NAKED_SYSCALL_SITE)) {
            let id = u32::from_le_bytes([
                snapshot[start + 3],
                snapshot[start + 4],
                snapshot[start + 5],
                snapshot[start + 6],
            ]);
            self.stats.naked_syscalls += 1;
            return self.redirect(start, NAKED_SYSCALL_SITE.len(), codegen::naked_syscall_trampoline(id as u64));
        }

        Err(PatchError::UnrecognizedSyscall(self.address + offset as u64))
    }

    fn interrupt(&mut self, insn: &Instruction, offset: usize) {
        self.buffer[offset] = 0x0F;
        self.buffer[offset + 1] = 0x0B;
        self.target.interrupts.insert(insn.ip(), insn.immediate8());
        self.stats.interrupts += 1;
    }

    fn fsbase_access(&mut self, insn: &Instruction, offset: usize) -> Result<(), PatchError> {
        let site = insn.ip();
        if insn.mnemonic() != Mnemonic::Mov
            || insn.op_count() != 2
            || insn.op0_kind() != OpKind::Register
            || insn.op1_kind() != OpKind::Memory
            || insn.memory_base() != Register::None
            || insn.memory_index() != Register::None
        {
            return Err(PatchError::UnsupportedFsOperand(site));
        }

        let register = insn.op0_register();
        let size = if register.is_gpr64() {
            8
        } else if register.is_gpr32() {
            4
        } else {
            return Err(PatchError::UnsupportedFsOperand(site));
        };
        let number = register.full_register().number() as u8;
        let disp = insn.memory_displacement64() as i64;

        let trampoline = codegen::fsbase_mov_trampoline(Gpr(number), size, disp, self.target.fs_mode)?;
        self.stats.fs_accesses += 1;
        self.redirect(offset, insn.len(), trampoline)
    }

    fn run(&mut self, region: Range<usize>) -> Result<(), PatchError> {
        // Patches rewrite bytes behind and at the decoder position, so decode
        // from an unmodified copy.
        let snapshot = self.buffer.to_vec();
        let mut decoder = Decoder::with_ip(
            64,
            &snapshot[region.clone()],
            self.address + region.start as u64,
            DecoderOptions::NONE,
        );

        let mut insn = Instruction::default();
        while decoder.can_decode() {
            decoder.decode_out(&mut insn);
            if insn.is_invalid() {
                trace!("Skipping undecodable byte at 0x{:016x}", insn.ip());
                continue;
            }
            let offset = (insn.ip() - self.address) as usize;

            match insn.code() {
                Code::Syscall => self.syscall(&snapshot, offset)?,
                Code::Int_imm8 => self.interrupt(&insn, offset),
                Code::Int1 | Code::Into => return Err(PatchError::UnsupportedInterrupt(insn.ip())),
                _ if !self.target.host_has_bmi1 && is_bmi1(insn.mnemonic()) => {
                    // Trapped and emulated at run time.
                    self.stats.bmi1_left_in_place += 1;
                }
                _ => match memory_segment_override(&insn) {
                    Some(Register::FS) => self.fsbase_access(&insn, offset)?,
                    Some(Register::DS | Register::ES | Register::GS) => {
                        return Err(PatchError::UnsupportedSegment(insn.ip()))
                    }
                    _ => {}
                },
            }
        }
        Ok(())
    }
}

/// Patch the code slice `region` of `buffer`, which is mapped at `address`.
pub fn patch_text(
    buffer: &mut [u8],
    address: u64,
    region: Range<usize>,
    target: &mut PatchTarget<'_>,
) -> Result<PatchStats, PatchError> {
    let mut patcher = Patcher {
        buffer,
        address,
        target,
        stats: PatchStats::default(),
    };
    patcher.run(region)?;

    let stats = patcher.stats;
    debug!(
        "Patched {} syscall, {} naked syscall, {} interrupt and {} fs sites; {} BMI1 instructions left to trap",
        stats.syscalls, stats.naked_syscalls, stats.interrupts, stats.fs_accesses, stats.bmi1_left_in_place
    );
    Ok(stats)
}
