//! Event flag (evf_*)
//!
//! A 64-bit pattern threads set and clear; waiters test it against a bit
//! mask with AND or OR semantics and may clear the matched bits.

use crate::objects::ObjectOps;
use ob_core::Errno;
use parking_lot::Mutex;

/// Creation attributes accepted by `evf_create`.
pub mod attr {
    pub const SINGLE_WAITER: u32 = 0x01;
    pub const MULTI_WAITER: u32 = 0x02;
    pub const FIFO: u32 = 0x10;
    pub const PRIORITY: u32 = 0x20;
    pub const SHARED: u32 = 0x100;

    /// Every bit `evf_create` tolerates.
    pub const VALID: u32 = 0x133;
}

/// Event flag wait modes
pub mod wait_mode {
    /// Wait for all of the specified bits
    pub const AND: u32 = 0x01;
    /// Wait for any of the specified bits
    pub const OR: u32 = 0x02;
    /// Clear all bits after waiting
    pub const CLEAR_ALL: u32 = 0x10;
    /// Clear the matched bits after waiting
    pub const CLEAR_PAT: u32 = 0x20;
}

/// Reject attribute combinations `evf_create` refuses.
pub fn validate_attributes(attributes: u32) -> Result<(), Errno> {
    let waiters = attributes & (attr::SINGLE_WAITER | attr::MULTI_WAITER);
    if attributes & !attr::VALID != 0 || waiters == (attr::SINGLE_WAITER | attr::MULTI_WAITER) {
        return Err(Errno::EINVAL);
    }
    Ok(())
}

#[derive(Debug)]
pub struct EventFlag {
    attributes: u32,
    pattern: Mutex<u64>,
}

impl EventFlag {
    pub fn new(attributes: u32, initial_pattern: u64) -> Self {
        Self {
            attributes,
            pattern: Mutex::new(initial_pattern),
        }
    }

    pub fn attributes(&self) -> u32 {
        self.attributes
    }

    pub fn pattern(&self) -> u64 {
        *self.pattern.lock()
    }

    pub fn set(&self, bits: u64) {
        *self.pattern.lock() |= bits;
    }

    /// Keep only the bits in `mask`.
    pub fn clear(&self, mask: u64) {
        *self.pattern.lock() &= mask;
    }

    /// Test the pattern without blocking. On a match returns the pattern as
    /// it was before any clear mode was applied.
    pub fn poll(&self, bits: u64, mode: u32) -> Result<u64, Errno> {
        if bits == 0 {
            return Err(Errno::EINVAL);
        }
        let mut pattern = self.pattern.lock();
        let matched = match mode & (wait_mode::AND | wait_mode::OR) {
            wait_mode::AND => *pattern & bits == bits,
            wait_mode::OR => *pattern & bits != 0,
            _ => return Err(Errno::EINVAL),
        };
        if !matched {
            return Err(Errno::EBUSY);
        }
        let before = *pattern;
        if mode & wait_mode::CLEAR_ALL != 0 {
            *pattern = 0;
        } else if mode & wait_mode::CLEAR_PAT != 0 {
            *pattern &= !bits;
        }
        Ok(before)
    }
}

impl ObjectOps for EventFlag {
    fn close(&self) -> Result<(), Errno> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_attributes() {
        assert!(validate_attributes(attr::SINGLE_WAITER | attr::FIFO).is_ok());
        assert!(validate_attributes(attr::VALID & !attr::MULTI_WAITER).is_ok());
        assert_eq!(validate_attributes(0x3), Err(Errno::EINVAL));
        assert_eq!(validate_attributes(0x400), Err(Errno::EINVAL));
    }

    #[test]
    fn test_and_or_modes() {
        let evf = EventFlag::new(attr::MULTI_WAITER, 0b0101);
        assert_eq!(evf.poll(0b0101, wait_mode::AND), Ok(0b0101));
        assert_eq!(evf.poll(0b0111, wait_mode::AND), Err(Errno::EBUSY));
        assert_eq!(evf.poll(0b0110, wait_mode::OR), Ok(0b0101));
        assert_eq!(evf.poll(0b1000, wait_mode::OR), Err(Errno::EBUSY));
        assert_eq!(evf.poll(0, wait_mode::OR), Err(Errno::EINVAL));
    }

    #[test]
    fn test_clear_modes() {
        let evf = EventFlag::new(0, 0);
        evf.set(0b1110);
        assert_eq!(evf.poll(0b0010, wait_mode::OR | wait_mode::CLEAR_PAT), Ok(0b1110));
        assert_eq!(evf.pattern(), 0b1100);
        assert_eq!(evf.poll(0b0100, wait_mode::AND | wait_mode::CLEAR_ALL), Ok(0b1100));
        assert_eq!(evf.pattern(), 0);

        evf.set(0xFF);
        evf.clear(0x0F);
        assert_eq!(evf.pattern(), 0x0F);
    }
}
