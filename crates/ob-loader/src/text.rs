//! Text region discovery
//!
//! Code and read-only data share the executable segment, so disassembling from
//! its start walks into data. The real code slice is bracketed by the `.init`
//! epilogue, the PLT and the `.fini` prologue, which are found by signature.

use crate::pattern::{self, ANY};
use std::ops::Range;

const INTERP: &[u8] = b"/libexec/ld-elf.so.1\0";

/// Tail of `.init` in executables.
pub const EXEC_INIT_EPILOGUE: [u16; 26] = [
    0x48, 0x85, 0xC0, // test rax, rax
    0x74, 0xF4, // jz
    0x48, 0x83, 0xF8, 0xFF, // cmp rax, -1
    0x74, 0x04, // jz
    0xFF, 0xD0, // call rax
    0xEB, 0xEA, // jmp
    0x48, 0x83, 0xC4, 0x08, // add rsp, 8
    0x5B, // pop rbx
    0x41, 0x5E, // pop r14
    0x41, 0x5F, // pop r15
    0x5D, // pop rbp
    0xC3, // ret
];

/// Start of `.fini` in executables.
pub const EXEC_FINI_PROLOGUE: [u16; 76] = [
    0x55, 0x48, 0x89, 0xE5, 0x53, 0x50, //
    0x8A, 0x05, ANY, ANY, ANY, ANY, //
    ANY, ANY, //
    0x75, 0x35, //
    0x48, 0x8B, 0x05, ANY, ANY, ANY, ANY, //
    0x48, 0x85, 0xC0, //
    0x74, 0x22, //
    0x48, 0x8D, 0x1D, ANY, ANY, ANY, ANY, //
    0x66, 0x66, 0x66, 0x66, 0x2E, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0xFF, 0xD0, //
    0x48, 0x8B, 0x03, //
    0x48, 0x83, 0xC3, 0x08, //
    0x48, 0x85, 0xC0, //
    0x75, 0xF2, //
    0xC6, 0x05, ANY, ANY, ANY, ANY, 0x01, //
    0x48, 0x83, 0xC4, 0x08, //
    0x5B, 0x5D, 0xC3,
];

/// Tail of `.init` in shared objects.
pub const SO_INIT_EPILOGUE: [u16; 17] = [
    0x31, 0xC0, // xor eax, eax
    0x48, 0x83, 0xC4, 0x08, // add rsp, 8
    0x5B, // pop rbx
    0x41, 0x5C, 0x41, 0x5D, 0x41, 0x5E, 0x41, 0x5F, // pop r12..r15
    0x5D, // pop rbp
    0xC3, // ret
];

/// Start of `.fini` in shared objects.
pub const SO_FINI_PROLOGUE: [u16; 125] = [
    0x55, 0x48, 0x89, 0xE5, 0x41, 0x56, 0x53, //
    ANY, ANY, ANY, ANY, ANY, ANY, ANY, ANY, ANY, ANY, ANY, //
    0x75, 0x61, //
    0x48, 0x85, 0xD2, //
    0x74, 0x04, //
    0xFF, 0xD2, //
    0xEB, 0x12, //
    0x45, 0x31, 0xF6, //
    0x48, 0x83, 0x3D, ANY, ANY, ANY, ANY, 0x00, //
    0x74, 0x08, //
    0xE8, ANY, ANY, ANY, ANY, //
    0x41, 0x89, 0xC6, //
    0x48, 0x83, 0x3D, ANY, ANY, ANY, ANY, 0x00, //
    0x74, 0x0F, //
    0x48, 0x8D, 0x05, ANY, ANY, ANY, ANY, //
    0x48, 0x8B, 0x38, //
    0xE8, ANY, ANY, ANY, ANY, //
    0x48, 0x8B, 0x05, ANY, ANY, ANY, ANY, //
    0x48, 0x85, 0xC0, //
    0x74, 0x17, //
    0x48, 0x8D, 0x1D, ANY, ANY, ANY, ANY, //
    0x66, 0x90, //
    0xFF, 0xD0, //
    0x48, 0x8B, 0x03, //
    0x48, 0x83, 0xC3, 0x08, //
    0x48, 0x85, 0xC0, //
    0x75, 0xF2, //
    0xC6, 0x05, ANY, ANY, ANY, ANY, 0x01, //
    0x44, 0x89, 0xF0, //
    0x5B, 0x41, 0x5E, 0x5D, 0xC3,
];

/// Size of one PLT entry.
pub const PLT_ENTRY_SIZE: usize = 16;

fn skip_nulls(buffer: &[u8], mut current: usize) -> usize {
    while current < buffer.len() && buffer[current] == 0 {
        current += 1;
    }
    current
}

/// `push [rip+x]; jmp [rip+y]; nop x4`
fn is_plt0(entry: &[u8]) -> bool {
    entry.len() >= PLT_ENTRY_SIZE
        && entry[0] == 0xFF
        && entry[1] == 0x35
        && entry[6] == 0xFF
        && entry[7] == 0x25
        && entry[12..16] == [0x90; 4]
}

/// `jmp [rip+x]; push imm32; jmp rel32`
fn is_plt_entry(entry: &[u8]) -> bool {
    entry.len() >= PLT_ENTRY_SIZE && entry[0] == 0xFF && entry[1] == 0x25 && entry[6] == 0x68 && entry[11] == 0xE9
}

fn skip_plt_entries(buffer: &[u8], mut current: usize) -> usize {
    while current + PLT_ENTRY_SIZE <= buffer.len() && is_plt_entry(&buffer[current..]) {
        current += PLT_ENTRY_SIZE;
    }
    current
}

fn find_after(buffer: &[u8], from: usize, pattern: &[u16]) -> Option<usize> {
    pattern::find(&buffer[from..], pattern).map(|at| from + at + pattern.len())
}

fn executable_text_region(buffer: &[u8]) -> Option<Range<usize>> {
    let mut start = 0;
    if buffer.starts_with(INTERP) {
        start = skip_nulls(buffer, INTERP.len());
    }

    let mut current = find_after(buffer, start, &EXEC_INIT_EPILOGUE)?;
    current = skip_nulls(buffer, current);
    current = find_after(buffer, current, &EXEC_FINI_PROLOGUE)?;
    current = skip_nulls(buffer, current);

    if current + PLT_ENTRY_SIZE > buffer.len() || !is_plt0(&buffer[current..]) {
        return None;
    }
    current = skip_plt_entries(buffer, current + PLT_ENTRY_SIZE);

    Some(start..current)
}

fn shared_object_text_region(buffer: &[u8]) -> Option<Range<usize>> {
    let mut current = find_after(buffer, 0, &SO_INIT_EPILOGUE)?;
    current = skip_nulls(buffer, current);

    if current + PLT_ENTRY_SIZE > buffer.len() {
        return None;
    }
    if !is_plt0(&buffer[current..]) {
        current = (current + 0xF) & !0xF;
        if current + PLT_ENTRY_SIZE > buffer.len() || !is_plt0(&buffer[current..]) {
            return None;
        }
    }
    current = skip_plt_entries(buffer, current + PLT_ENTRY_SIZE);

    current = find_after(buffer, current, &SO_FINI_PROLOGUE)?;
    current = skip_nulls(buffer, current);

    Some(0..current)
}

/// Locate the code slice of an executable segment's file contents. The
/// buffer must start on a 16-byte boundary.
pub fn find_text_region(buffer: &[u8]) -> Option<Range<usize>> {
    executable_text_region(buffer).or_else(|| shared_object_text_region(buffer))
}

/// Concrete bytes for a pattern, with wildcards set to zero.
#[cfg(any(test, feature = "test-util"))]
pub fn pattern_bytes(pattern: &[u16]) -> Vec<u8> {
    pattern
        .iter()
        .map(|&e| if e == pattern::MATCH_ANY { 0 } else { e as u8 })
        .collect()
}

/// PLT0 followed by `count` PLT entries.
#[cfg(any(test, feature = "test-util"))]
pub fn plt_bytes(count: usize) -> Vec<u8> {
    let mut out = vec![0xFF, 0x35, 0, 0, 0, 0, 0xFF, 0x25, 0, 0, 0, 0, 0x90, 0x90, 0x90, 0x90];
    for i in 0..count {
        out.extend_from_slice(&[0xFF, 0x25, 0, 0, 0, 0, 0x68, i as u8, 0, 0, 0, 0xE9, 0, 0, 0, 0]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executable_layout() {
        let mut buffer = INTERP.to_vec();
        buffer.resize(0x20, 0);
        let code_start = buffer.len();
        buffer.extend_from_slice(&[0x90; 8]);
        buffer.extend(pattern_bytes(&EXEC_INIT_EPILOGUE));
        buffer.extend_from_slice(&[0, 0]);
        buffer.extend(pattern_bytes(&EXEC_FINI_PROLOGUE));
        buffer.resize((buffer.len() + 15) & !15, 0);
        buffer.extend(plt_bytes(3));
        let code_end = buffer.len();
        buffer.extend_from_slice(b"read-only data follows");

        assert_eq!(find_text_region(&buffer), Some(code_start..code_end));
    }

    #[test]
    fn test_shared_object_layout() {
        let mut buffer = vec![0xC3; 0x10];
        buffer.extend(pattern_bytes(&SO_INIT_EPILOGUE));
        // PLT0 is only found after realigning to 16 bytes.
        buffer.extend_from_slice(&[0xCC; 3]);
        buffer.resize((buffer.len() + 15) & !15, 0xCC);
        buffer.extend(plt_bytes(2));
        buffer.extend_from_slice(&[0x90; 5]);
        buffer.extend(pattern_bytes(&SO_FINI_PROLOGUE));
        buffer.extend_from_slice(&[0, 0, 0]);
        let code_end = buffer.len();
        buffer.extend_from_slice(b"\x01\x02\x03");

        assert_eq!(find_text_region(&buffer), Some(0..code_end));
    }

    #[test]
    fn test_missing_signatures() {
        assert_eq!(find_text_region(&[0x90; 256]), None);

        let mut buffer = pattern_bytes(&SO_INIT_EPILOGUE);
        buffer.extend_from_slice(&[0xCC; 64]);
        assert_eq!(find_text_region(&buffer), None);
    }
}
