//! Encoded symbol names
//!
//! Imported and exported symbols are named `name#L#M` where `L` and `M` are
//! library and module ids written in a 64-character alphabet, most
//! significant digit first.

const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+-";

/// Split parts of an encoded name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedName<'a> {
    pub name: &'a str,
    pub library_id: u16,
    pub module_id: u16,
}

fn decode_value(digits: &str) -> Option<u64> {
    digits.bytes().try_fold(0u64, |value, c| {
        let index = ALPHABET.iter().position(|&a| a == c)?;
        Some((value << 6) | index as u64)
    })
}

fn encode_value(mut value: u64, out: &mut String) {
    let mut digits = Vec::new();
    loop {
        digits.push(ALPHABET[(value & 63) as usize]);
        value >>= 6;
        if value == 0 {
            break;
        }
    }
    out.extend(digits.iter().rev().map(|&c| c as char));
}

/// Parse `name#L#M`. Each id may be at most three digits long.
pub fn parse_symbol_name(buffer: &str) -> Option<EncodedName<'_>> {
    let library_index = buffer.find('#')?;
    let module_index = library_index + 1 + buffer[library_index + 1..].find('#')?;

    if module_index - library_index > 4 || buffer.len() - module_index > 4 {
        return None;
    }

    let library_id = decode_value(&buffer[library_index + 1..module_index])?;
    let module_id = decode_value(&buffer[module_index + 1..])?;

    Some(EncodedName {
        name: &buffer[..library_index],
        library_id: library_id as u16,
        module_id: module_id as u16,
    })
}

/// Inverse of [`parse_symbol_name`].
pub fn encode_symbol_name(name: &str, library_id: u16, module_id: u16) -> String {
    let mut out = String::with_capacity(name.len() + 8);
    out.push_str(name);
    out.push('#');
    encode_value(library_id as u64, &mut out);
    out.push('#');
    encode_value(module_id as u64, &mut out);
    out
}

/// System V ELF hash.
pub fn elf_hash(name: &str) -> u32 {
    let mut h: u32 = 0;
    for &c in name.as_bytes() {
        h = (h << 4).wrapping_add(c as u32);
        let g = h & 0xF000_0000;
        if g != 0 {
            h ^= g >> 24;
        }
        h &= !g;
    }
    h
}
