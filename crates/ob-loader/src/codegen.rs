//! Trampoline code generators
//!
//! Patched guest instructions jump into small pieces of machine code emitted
//! into the module's RIP zone. Each generator produces position independent
//! bytes that end in a zeroed [`Tail`]; the body reaches the tail through
//! RIP-relative loads, so the patcher only has to fill the tail after
//! copying the code into place.

use crate::rip_zone::{RipPointers, Tail};
use ob_core::error::PatchError;

/// General purpose register by hardware number (`rax` = 0 .. `r15` = 15).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gpr(pub u8);

impl Gpr {
    pub const RAX: Gpr = Gpr(0);
    pub const RCX: Gpr = Gpr(1);
    pub const RDX: Gpr = Gpr(2);
    pub const RBX: Gpr = Gpr(3);
    pub const RSP: Gpr = Gpr(4);
    pub const RBP: Gpr = Gpr(5);
    pub const RSI: Gpr = Gpr(6);
    pub const RDI: Gpr = Gpr(7);
    pub const R8: Gpr = Gpr(8);
    pub const R12: Gpr = Gpr(12);
    pub const R13: Gpr = Gpr(13);
    pub const R15: Gpr = Gpr(15);

    fn low(self) -> u8 {
        self.0 & 7
    }

    fn extended(self) -> bool {
        self.0 >= 8
    }
}

/// Where emitted code finds the guest `fs` base.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FsBaseMode {
    /// Read `RipPointers::fsbase` of the module.
    #[default]
    RipPointers,
    /// The host `gs` base of each thread holds the guest `fs` base.
    HostGs,
}

/// Which tail field a RIP-relative operand refers to.
#[derive(Debug, Clone, Copy)]
enum TailField {
    Target,
    RipPointers,
}

impl TailField {
    fn offset(self) -> usize {
        match self {
            TailField::Target => Tail::TARGET_OFFSET,
            TailField::RipPointers => Tail::RIP_POINTERS_OFFSET,
        }
    }
}

/// Forward `rel8` branch waiting for its destination.
#[derive(Debug)]
#[must_use]
struct Label(usize);

/// Byte emitter with just enough x86-64 encoding for the trampolines.
#[derive(Debug, Default)]
struct CodeBuffer {
    bytes: Vec<u8>,
    tail_fixups: Vec<(usize, TailField)>,
}

impl CodeBuffer {
    fn emit(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    fn push(&mut self, reg: Gpr) {
        if reg.extended() {
            self.emit(&[0x41]);
        }
        self.emit(&[0x50 + reg.low()]);
    }

    fn pop(&mut self, reg: Gpr) {
        if reg.extended() {
            self.emit(&[0x41]);
        }
        self.emit(&[0x58 + reg.low()]);
    }

    /// `mov dst, src` on 64-bit registers.
    fn mov_reg(&mut self, dst: Gpr, src: Gpr) {
        let rex = 0x48 | ((src.extended() as u8) << 2) | dst.extended() as u8;
        self.emit(&[rex, 0x89, 0xC0 | (src.low() << 3) | dst.low()]);
    }

    fn mov_imm64(&mut self, dst: Gpr, value: u64) {
        self.emit(&[0x48 | dst.extended() as u8, 0xB8 + dst.low()]);
        self.emit(&value.to_le_bytes());
    }

    /// `mov dst, [rip + tail.field]`
    fn load_tail(&mut self, dst: Gpr, field: TailField) {
        self.emit(&[0x48 | ((dst.extended() as u8) << 2), 0x8B, (dst.low() << 3) | 0b101]);
        self.rip_disp(field);
    }

    /// `jmp [rip + tail.target]`
    fn jmp_tail_target(&mut self) {
        self.emit(&[0xFF, 0x25]);
        self.rip_disp(TailField::Target);
    }

    fn rip_disp(&mut self, field: TailField) {
        self.tail_fixups.push((self.bytes.len(), field));
        self.emit(&[0; 4]);
    }

    /// `mov dst, [base + disp]` with a 32- or 64-bit destination.
    fn load(&mut self, dst: Gpr, base: Gpr, disp: i32, wide: bool) {
        let rex = ((wide as u8) << 3) | ((dst.extended() as u8) << 2) | base.extended() as u8;
        if rex != 0 {
            self.emit(&[0x40 | rex]);
        }
        self.emit(&[0x8B]);
        self.mem_operand(dst.low(), base, disp);
    }

    fn mem_operand(&mut self, reg: u8, base: Gpr, disp: i32) {
        let needs_disp = disp != 0 || base.low() == 5;
        let (mode, short) = if !needs_disp {
            (0b00, false)
        } else if i8::try_from(disp).is_ok() {
            (0b01, true)
        } else {
            (0b10, false)
        };
        self.emit(&[(mode << 6) | (reg << 3) | base.low()]);
        if base.low() == 4 {
            self.emit(&[0x24]);
        }
        match mode {
            0b01 if short => self.emit(&[disp as i8 as u8]),
            0b10 => self.emit(&disp.to_le_bytes()),
            _ => {}
        }
    }

    /// `mov dst, gs:[disp32]`
    fn load_gs_absolute(&mut self, dst: Gpr, disp: i32, wide: bool) {
        self.emit(&[0x65]);
        let rex = ((wide as u8) << 3) | ((dst.extended() as u8) << 2);
        if rex != 0 {
            self.emit(&[0x40 | rex]);
        }
        self.emit(&[0x8B, (dst.low() << 3) | 0b100, 0x25]);
        self.emit(&disp.to_le_bytes());
    }

    fn jump_short(&mut self, opcode: u8) -> Label {
        self.emit(&[opcode, 0]);
        Label(self.bytes.len() - 1)
    }

    fn bind(&mut self, label: Label) {
        let rel = self.bytes.len() - (label.0 + 1);
        debug_assert!(rel <= i8::MAX as usize);
        self.bytes[label.0] = rel as u8;
    }

    fn finish_with_tail(mut self) -> Trampoline {
        let tail_start = self.bytes.len();
        self.emit(&[0; Tail::SIZE]);
        for (at, field) in std::mem::take(&mut self.tail_fixups) {
            let rel = (tail_start + field.offset()) as i64 - (at + 4) as i64;
            self.bytes[at..at + 4].copy_from_slice(&(rel as i32).to_le_bytes());
        }
        Trampoline { code: self.bytes }
    }
}

/// Emitted code ending in a zeroed [`Tail`].
#[derive(Debug, Clone)]
pub struct Trampoline {
    code: Vec<u8>,
}

impl Trampoline {
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }
}

/// Save the guest's nonvolatile registers, realign the stack, reserve the
/// result slot and push its address as the last handler argument.
fn syscall_prologue(code: &mut CodeBuffer) {
    code.push(Gpr::RBP);
    code.mov_reg(Gpr::RBP, Gpr::RSP);
    code.emit(&[0x48, 0x83, 0xE4, 0xF0]); // and rsp, -16
    code.push(Gpr::RBP);
    for reg in 12..=15 {
        code.push(Gpr(reg));
    }
    code.push(Gpr::RBX);
    code.emit(&[0x48, 0x83, 0xEC, 0x08]); // sub rsp, 8
    code.emit(&[0x48, 0xC7, 0x04, 0x24, 0, 0, 0, 0]); // mov qword [rsp], 0
    code.push(Gpr::RSP);
}

/// Stack the four trailing handler arguments; the id is in rax.
fn pack_args_id_in_rax(code: &mut CodeBuffer, fourth: Gpr) {
    code.push(Gpr(9));
    code.push(Gpr::R8);
    code.push(fourth);
    code.push(Gpr::RDX);
    code.mov_reg(Gpr(9), Gpr::RSI);
    code.mov_reg(Gpr::R8, Gpr::RDI);
}

/// Indirect `syscall(id, ...)`: the id is the first guest argument and the
/// rest shift down one slot.
fn pack_args_id_in_rdi(code: &mut CodeBuffer, fourth: Gpr) {
    code.emit(&[0x6A, 0x00]); // push 0
    code.push(Gpr(9));
    code.push(Gpr::R8);
    code.push(fourth);
    code.mov_reg(Gpr(9), Gpr::RDX);
    code.mov_reg(Gpr::R8, Gpr::RSI);
    code.mov_reg(Gpr::RDX, Gpr::RDI);
}

/// Call the handler, turn its boolean into CF, load the result into rax
/// and resume the guest.
fn syscall_epilogue(mut code: CodeBuffer) -> Trampoline {
    code.load_tail(Gpr::RCX, TailField::RipPointers);
    code.emit(&[0x48, 0x8B, 0x49, RipPointers::RUNTIME_OFFSET]); // mov rcx, [rcx+runtime]

    // Shadow space.
    code.push(Gpr(9));
    code.push(Gpr::R8);
    code.push(Gpr::RDX);
    code.push(Gpr::RCX);

    code.load_tail(Gpr::RAX, TailField::RipPointers);
    code.emit(&[0xFF, 0x50, RipPointers::SYSCALL_HANDLER_OFFSET]); // call [rax+handler]

    // Shadow space, four stack arguments, result pointer and result slot.
    code.emit(&[0x48, 0x83, 0xC4, 0x50]); // add rsp, 80
    code.emit(&[0x2C, 0x01]); // sub al, 1
    code.emit(&[0x48, 0x8B, 0x44, 0x24, 0xF8]); // mov rax, [rsp-8]

    code.pop(Gpr::RBX);
    for reg in (12..=15).rev() {
        code.pop(Gpr(reg));
    }
    code.pop(Gpr::RSP);
    code.pop(Gpr::RBP);
    code.jmp_tail_target();
    code.finish_with_tail()
}

/// Trampoline for `mov r10, rcx; syscall`. The id arrives in rax; an id of
/// zero means the real id is the first argument.
///
/// The handler is called with the Windows x64 convention as
/// `handler(runtime, id, a0, a1, a2, a3, a4, a5, &mut result) -> bool`.
pub fn syscall_trampoline() -> Trampoline {
    let mut code = CodeBuffer::default();
    syscall_prologue(&mut code);

    code.emit(&[0x48, 0x83, 0xF8, 0x00]); // cmp rax, 0
    let id_in_rdi = code.jump_short(0x74);
    pack_args_id_in_rax(&mut code, Gpr::RCX);
    code.mov_reg(Gpr::RDX, Gpr::RAX);
    let call = code.jump_short(0xEB);
    code.bind(id_in_rdi);
    pack_args_id_in_rdi(&mut code, Gpr::RCX);
    code.bind(call);

    syscall_epilogue(code)
}

/// Trampoline for `mov rax, imm32; syscall` with the id baked in. The
/// fourth guest argument is already in r10 at such sites.
pub fn naked_syscall_trampoline(id: u64) -> Trampoline {
    let mut code = CodeBuffer::default();
    syscall_prologue(&mut code);

    if id != 0 {
        pack_args_id_in_rax(&mut code, Gpr(10));
        code.mov_imm64(Gpr::RDX, id);
    } else {
        pack_args_id_in_rdi(&mut code, Gpr(10));
    }

    syscall_epilogue(code)
}

/// Trampoline replacing `mov reg, fs:[disp]`. `size` is the destination
/// width in bytes and must be 4 or 8.
pub fn fsbase_mov_trampoline(
    reg: Gpr,
    size: usize,
    disp: i64,
    mode: FsBaseMode,
) -> Result<Trampoline, PatchError> {
    let wide = match size {
        8 => true,
        4 => false,
        _ => return Err(PatchError::UnsupportedFsOperand(disp as u64)),
    };
    if reg.0 > 15 || reg == Gpr::RSP {
        return Err(PatchError::UnsupportedFsOperand(disp as u64));
    }
    let disp = i32::try_from(disp).map_err(|_| PatchError::UnsupportedFsOperand(disp as u64))?;

    let mut code = CodeBuffer::default();
    match mode {
        FsBaseMode::RipPointers => {
            code.load_tail(reg, TailField::RipPointers);
            code.load(reg, reg, RipPointers::FSBASE_OFFSET as i32, true);
            code.load(reg, reg, disp, wide);
        }
        FsBaseMode::HostGs => code.load_gs_absolute(reg, disp, wide),
    }
    code.jmp_tail_target();
    Ok(code.finish_with_tail())
}

/// Host-to-guest entry shim, callable as `extern "sysv64" fn(*const u64)`.
/// The argument is passed through untouched in rdi; the shim preserves the
/// host's nonvolatile registers around the guest call.
pub fn entry_trampoline(entry: u64) -> Vec<u8> {
    let mut code = CodeBuffer::default();
    code.push(Gpr::RBP);
    code.mov_reg(Gpr::RBP, Gpr::RSP);
    for reg in 12..=15 {
        code.push(Gpr(reg));
    }
    code.push(Gpr::RBX);
    code.emit(&[0x48, 0x83, 0xEC, 0x08]); // sub rsp, 8
    code.mov_imm64(Gpr::RAX, entry);
    code.emit(&[0xFF, 0xD0]); // call rax
    code.emit(&[0x48, 0x83, 0xC4, 0x08]); // add rsp, 8
    code.pop(Gpr::RBX);
    for reg in (12..=15).rev() {
        code.pop(Gpr(reg));
    }
    code.pop(Gpr::RBP);
    code.emit(&[0xC3]);
    code.bytes
}
