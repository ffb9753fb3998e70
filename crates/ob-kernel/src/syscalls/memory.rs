//! Virtual memory and shared memory syscalls

use super::{handle_arg, lookup};
use crate::guest;
use crate::memory::{allocate_anonymous, map_flags};
use crate::objects::file::flags as open_flags;
use crate::objects::{MapRequest, Object, ObjectKind, ObjectOps, SharedMemory};
use crate::runtime::Runtime;
use crate::syscall::{SyscallError, SyscallResult};
use ob_core::Errno;

/// The `fd` of an anonymous mapping.
const NO_FD: u32 = 0xFFFF_FFFF;

/// Flags shm_open accepts besides the access mode.
const SHM_OPEN_FLAGS: u32 = open_flags::O_CREAT | open_flags::O_TRUNC | open_flags::O_EXCL;

const DEFAULT_DMEM_CONTAINER: u32 = 0xFFFF_FFFF;

/// munmap(addr, len)
pub unsafe fn sys_munmap(_runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    tracing::debug!("munmap: 0x{:x} (0x{:x})", args[0], args[1]);
    Ok(0)
}

/// mprotect(addr, len, prot)
pub unsafe fn sys_mprotect(_runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    tracing::debug!("mprotect: 0x{:x} (0x{:x}) {:x}", args[0], args[1], args[2] as u32);
    Ok(0)
}

/// mmap(addr, len, prot, flags, fd, offset)
pub unsafe fn sys_mmap(runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    let addr = args[0];
    let len = args[1];
    let prot = args[2] as u32;
    let mut flags = args[3] as u32;
    let fd = handle_arg(args[4]);
    let offset = args[5];
    tracing::debug!(
        "mmap: addr=0x{:x}, len=0x{:x}, prot={:x}, flags={:x}, fd={}, offset=0x{:x}",
        addr,
        len,
        prot,
        flags,
        fd as i32,
        offset
    );

    if flags & !map_flags::SUPPORTED != 0 {
        return Err(Errno::EINVAL.into());
    }
    if flags & map_flags::STACK != 0 {
        flags |= map_flags::ANONYMOUS;
    }

    let allocation = if fd != NO_FD {
        let object = lookup(runtime, fd)?;
        object.mmap(&MapRequest {
            addr,
            len,
            prot,
            flags,
            offset,
        })?
    } else {
        allocate_anonymous(addr, len, flags & map_flags::FIXED != 0)?
    };
    tracing::debug!("mmap: 0x{:x}", allocation);

    if flags & map_flags::ANONYMOUS != 0 {
        guest::fill(allocation, 0, len as usize)?;
    }
    if flags & map_flags::STACK != 0 {
        return Ok(allocation + len);
    }
    Ok(allocation)
}

/// ftruncate(fd, length)
pub unsafe fn sys_ftruncate(runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    let fd = handle_arg(args[0]);
    let length = args[1] as i64;
    tracing::debug!("ftruncate: {:x} 0x{:x}", fd, length);
    if length < 0 {
        return Err(Errno::EINVAL.into());
    }

    let object = lookup(runtime, fd)?;
    object.truncate(length as u64)?;
    Ok(0)
}

/// shm_open(path, flags, mode)
pub unsafe fn sys_shm_open(runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    let path = guest::read_cstr(args[0])?;
    let flags = args[1] as u32;
    let mode = args[2] as u16 as u32;
    tracing::debug!("shm_open: {} {:x} {:x}", path, flags, mode);

    let access = flags & open_flags::O_ACCMODE;
    if access != open_flags::O_RDONLY && access != open_flags::O_RDWR {
        return Err(Errno::EINVAL.into());
    }
    if flags & !(open_flags::O_ACCMODE | SHM_OPEN_FLAGS) != 0 {
        return Err(Errno::EINVAL.into());
    }

    let table = runtime.object_table();
    if let Some(handle) = table.lookup_by_name(&path) {
        return Ok(handle as u64);
    }
    if flags & open_flags::O_CREAT == 0 {
        return Err(Errno::ESRCH.into());
    }

    let shm = Object::new(ObjectKind::SharedMemory(SharedMemory::new(&path, flags, mode)));
    let handle = table.add(shm).map_err(|_| Errno::EAGAIN)?;
    if let Err(e) = table.add_name(&path, handle) {
        table.release(handle)?;
        return Err(e.into());
    }
    Ok(handle as u64)
}

/// dmem_container(container)
pub unsafe fn sys_dmem_container(_runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    if args[0] as u32 == DEFAULT_DMEM_CONTAINER {
        return Ok(0);
    }
    tracing::warn!("dmem_container({}) is not supported", args[0] as u32);
    Err(SyscallError::FAILED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::ObjectType;
    use ob_core::Config;
    use std::ffi::CString;

    fn shm_open(runtime: &Runtime, path: &str, flags: u32) -> SyscallResult {
        let path = CString::new(path).unwrap();
        unsafe { sys_shm_open(runtime, [path.as_ptr() as u64, flags as u64, 0o600, 0, 0, 0]) }
    }

    #[test]
    fn test_anonymous_mmap() {
        let runtime = Runtime::new(Config::default());
        let flags = (map_flags::PRIVATE | map_flags::ANONYMOUS) as u64;
        let addr = unsafe { sys_mmap(&runtime, [0, 0x8000, 3, flags, NO_FD as u64, 0]) }.unwrap();
        assert_ne!(addr, 0);
        let bytes = unsafe { guest::read_bytes(addr, 0x8000) }.unwrap();
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_stack_mmap_returns_end() {
        let runtime = Runtime::new(Config::default());
        let flags = map_flags::STACK as u64;
        let end = unsafe { sys_mmap(&runtime, [0, 0x4000, 3, flags, NO_FD as u64, 0]) }.unwrap();
        // The last byte below the returned end is writable.
        unsafe { guest::write(end - 8, 0x1234u64) }.unwrap();
    }

    #[test]
    fn test_mmap_rejects_unknown_flags_and_descriptors() {
        let runtime = Runtime::new(Config::default());
        let result = unsafe { sys_mmap(&runtime, [0, 0x1000, 3, 0x8000, NO_FD as u64, 0]) };
        assert_eq!(result, Err(Errno::EINVAL.into()));
        let result = unsafe { sys_mmap(&runtime, [0, 0x1000, 3, 0x1, 40, 0]) };
        assert_eq!(result, Err(Errno::EBADF.into()));
    }

    #[test]
    fn test_shm_open_create_and_reopen() {
        let runtime = Runtime::new(Config::default());
        let create = open_flags::O_RDWR | open_flags::O_CREAT;

        assert_eq!(shm_open(&runtime, "/SceShm", open_flags::O_RDWR), Err(Errno::ESRCH.into()));
        let handle = shm_open(&runtime, "/SceShm", create).unwrap() as u32;
        assert!(runtime.object_table().lookup_typed(handle, ObjectType::SharedMemory).is_some());
        assert_eq!(runtime.object_table().handle_ref_count(handle), Some(1));

        let again = shm_open(&runtime, "/sceshm", open_flags::O_RDWR).unwrap() as u32;
        assert_eq!(again, handle);
        assert_eq!(runtime.object_table().handle_ref_count(handle), Some(2));
    }

    #[test]
    fn test_shm_open_flag_checks() {
        let runtime = Runtime::new(Config::default());
        assert_eq!(shm_open(&runtime, "/a", open_flags::O_WRONLY | open_flags::O_CREAT), Err(Errno::EINVAL.into()));
        assert_eq!(shm_open(&runtime, "/a", open_flags::O_RDWR | open_flags::O_APPEND), Err(Errno::EINVAL.into()));
    }

    #[test]
    fn test_truncate_then_map_shared_memory() {
        let runtime = Runtime::new(Config::default());
        let handle = shm_open(&runtime, "/map", open_flags::O_RDWR | open_flags::O_CREAT).unwrap();

        assert_eq!(unsafe { sys_ftruncate(&runtime, [handle, (-1i64) as u64, 0, 0, 0, 0]) }, Err(Errno::EINVAL.into()));
        assert_eq!(unsafe { sys_ftruncate(&runtime, [handle, 0x4000, 0, 0, 0, 0]) }, Ok(0));

        let flags = map_flags::SHARED as u64;
        let first = unsafe { sys_mmap(&runtime, [0, 0x4000, 3, flags, handle, 0]) }.unwrap();
        let second = unsafe { sys_mmap(&runtime, [0, 0x4000, 3, flags, handle, 0]) }.unwrap();
        assert_ne!(first, second);
        unsafe {
            guest::write(first, 0xFEEDu32).unwrap();
            assert_eq!(guest::read::<u32>(second).unwrap(), 0xFEED);
        }
    }

    #[test]
    fn test_dmem_container() {
        let runtime = Runtime::new(Config::default());
        assert_eq!(unsafe { sys_dmem_container(&runtime, [u64::MAX, 0, 0, 0, 0, 0]) }, Ok(0));
        assert_eq!(unsafe { sys_dmem_container(&runtime, [1, 0, 0, 0, 0, 0]) }, Err(SyscallError::FAILED));
    }
}
