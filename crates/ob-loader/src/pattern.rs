//! Wildcard byte patterns
//!
//! Each pattern element is a 16-bit word: the low byte is the expected value
//! and the high byte is a mask of bits to ignore. [`MATCH_ANY`] accepts every
//! byte.

pub const MATCH_ANY: u16 = 0xCC00;

/// Shorthand for building pattern tables.
pub const ANY: u16 = MATCH_ANY;

#[inline]
fn byte_matches(byte: u8, element: u16) -> bool {
    if element == MATCH_ANY {
        return true;
    }
    let value = element as u8;
    let mask = (element >> 8) as u8;
    byte & !mask == value & !mask
}

/// True if `pattern` matches at the start of `data`.
pub fn matches_at(data: &[u8], pattern: &[u16]) -> bool {
    data.len() >= pattern.len()
        && data
            .iter()
            .zip(pattern)
            .all(|(&byte, &element)| byte_matches(byte, element))
}

/// Offset of the first match of `pattern` in `data`.
pub fn find(data: &[u8], pattern: &[u16]) -> Option<usize> {
    if pattern.is_empty() || data.len() < pattern.len() {
        return None;
    }
    (0..=data.len() - pattern.len()).find(|&i| matches_at(&data[i..], pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_and_wildcard() {
        let data = [0x90, 0x48, 0xC7, 0xC0, 0x04, 0x00, 0x00, 0x00, 0x0F, 0x05];
        let pattern = [0x48, 0xC7, 0xC0, ANY, ANY, ANY, ANY, 0x0F, 0x05];
        assert_eq!(find(&data, &pattern), Some(1));
        assert!(!matches_at(&data, &pattern));
        assert!(matches_at(&data[1..], &pattern));
    }

    #[test]
    fn test_masked_bits() {
        // Ignore the low nibble.
        let pattern = [0x0F50];
        assert!(matches_at(&[0x5A], &pattern));
        assert!(matches_at(&[0x50], &pattern));
        assert!(!matches_at(&[0x6A], &pattern));
    }

    #[test]
    fn test_no_match() {
        assert_eq!(find(&[0x0F], &[0x0F, 0x05]), None);
        assert_eq!(find(&[0x0F, 0x04], &[0x0F, 0x05]), None);
        assert_eq!(find(&[], &[]), None);
    }
}
