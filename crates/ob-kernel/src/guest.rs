//! Access to guest pointers
//!
//! Guest code runs in the host address space, so a guest pointer is a host
//! pointer. These helpers only reject null; anything else is trusted the
//! same way the hardware would trust it.

use bytemuck::Pod;
use ob_core::Errno;

/// Read a NUL-terminated string.
///
/// # Safety
///
/// `addr` must be null or point to a readable NUL-terminated string.
pub unsafe fn read_cstr(addr: u64) -> Result<String, Errno> {
    if addr == 0 {
        return Err(Errno::EINVAL);
    }
    let s = std::ffi::CStr::from_ptr(addr as *const std::ffi::c_char);
    Ok(s.to_string_lossy().into_owned())
}

/// Read `len` bytes.
///
/// # Safety
///
/// `addr` must be null or valid for reads of `len` bytes.
pub unsafe fn read_bytes(addr: u64, len: usize) -> Result<Vec<u8>, Errno> {
    if addr == 0 {
        return Err(Errno::EINVAL);
    }
    Ok(std::slice::from_raw_parts(addr as *const u8, len).to_vec())
}

/// # Safety
///
/// `addr` must be null or valid for reads of `T`.
pub unsafe fn read<T: Pod>(addr: u64) -> Result<T, Errno> {
    if addr == 0 {
        return Err(Errno::EINVAL);
    }
    Ok((addr as *const T).read_unaligned())
}

/// # Safety
///
/// `addr` must be null or valid for writes of `T`.
pub unsafe fn write<T: Pod>(addr: u64, value: T) -> Result<(), Errno> {
    if addr == 0 {
        return Err(Errno::EINVAL);
    }
    (addr as *mut T).write_unaligned(value);
    Ok(())
}

/// # Safety
///
/// `addr` must be null or valid for writes of `data.len()` bytes.
pub unsafe fn write_bytes(addr: u64, data: &[u8]) -> Result<(), Errno> {
    if addr == 0 {
        return Err(Errno::EINVAL);
    }
    std::ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut u8, data.len());
    Ok(())
}

/// # Safety
///
/// `addr` must be null or valid for writes of `len` bytes.
pub unsafe fn fill(addr: u64, byte: u8, len: usize) -> Result<(), Errno> {
    if addr == 0 {
        return Err(Errno::EINVAL);
    }
    std::ptr::write_bytes(addr as *mut u8, byte, len);
    Ok(())
}

/// Copy `value` into a fixed-size, NUL-padded name field.
pub fn copy_name(field: &mut [u8], value: &str) {
    field.fill(0);
    let len = value.len().min(field.len());
    field[..len].copy_from_slice(&value.as_bytes()[..len]);
}

/// Write `value` as a C string into a buffer of `capacity` bytes, truncating
/// like `snprintf`. Returns the untruncated length.
///
/// # Safety
///
/// `addr` must be null or valid for writes of `capacity` bytes.
pub unsafe fn write_cstr(addr: u64, capacity: usize, value: &str) -> Result<usize, Errno> {
    if addr == 0 {
        return Err(Errno::EINVAL);
    }
    if capacity > 0 {
        let len = value.len().min(capacity - 1);
        std::ptr::copy_nonoverlapping(value.as_ptr(), addr as *mut u8, len);
        *(addr as *mut u8).add(len) = 0;
    }
    Ok(value.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_pointers_rejected() {
        unsafe {
            assert_eq!(read::<u32>(0), Err(Errno::EINVAL));
            assert_eq!(write(0, 1u64), Err(Errno::EINVAL));
            assert_eq!(read_cstr(0), Err(Errno::EINVAL));
        }
    }

    #[test]
    fn test_read_and_write() {
        let mut word = 0u64;
        let addr = &mut word as *mut u64 as u64;
        unsafe {
            write(addr, 0x1122_3344_5566_7788u64).unwrap();
            assert_eq!(read::<u32>(addr).unwrap(), 0x5566_7788);
        }
        assert_eq!(word, 0x1122_3344_5566_7788);

        let name = b"libkernel\0";
        assert_eq!(unsafe { read_cstr(name.as_ptr() as u64) }.unwrap(), "libkernel");
    }

    #[test]
    fn test_write_cstr_truncates() {
        let mut buffer = [0xFFu8; 4];
        let len = unsafe { write_cstr(buffer.as_mut_ptr() as u64, 4, "uplift") }.unwrap();
        assert_eq!(len, 6);
        assert_eq!(&buffer, b"upl\0");
    }

    #[test]
    fn test_copy_name() {
        let mut field = [0xAAu8; 8];
        copy_name(&mut field, "libc");
        assert_eq!(&field, b"libc\0\0\0\0");
    }
}
