//! Process, thread and signal syscalls
//!
//! Most of these are answered with fixed values; the guest only needs them
//! to get through libkernel initialization.

use crate::guest;
use crate::runtime::Runtime;
use crate::syscall::{SyscallError, SyscallResult};
use bytemuck::{Pod, Zeroable};

/// Process id reported to the guest.
pub const PID: u64 = 123;

const AMD64_SET_FSBASE: u64 = 129;
const AUTHINFO_SIZE: usize = 136;
const RANDOMIZED_PATH: &str = "uplift";
const THREAD_ID: u64 = 357;
const THREAD_SELF_RESULT: u64 = 135;
const THREAD_NAME_CAPACITY: usize = 31;

const MDBG_SERVICE_OP_1: u64 = 1;

const REGMGR_GET_NONSYS_INT: u32 = 25;
const REGMGR_NOT_FOUND: u64 = 0x800D_0203;
/// Registry keys answered with 0.
const REGMGR_KNOWN_KEYS: [u64; 2] = [0x0CAE_671A_DF3A_EB34, 0x3386_6083_5BDE_7CB1];

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct NonSystemInt {
    encoded_id: u64,
    unknown: u32,
    value: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ProcTypeInfo {
    struct_size: u64,
    budget: u32,
    flags: u32,
}

/// exit(status)
pub unsafe fn sys_exit(_runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    tracing::warn!("exit({}) is not supported", args[0] as i32);
    Err(SyscallError::FAILED)
}

/// getpid()
pub unsafe fn sys_getpid(_runtime: &Runtime, _args: [u64; 6]) -> SyscallResult {
    Ok(PID)
}

/// sysarch(number, args)
pub unsafe fn sys_sysarch(runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    if args[0] as u32 as u64 != AMD64_SET_FSBASE {
        tracing::warn!("sysarch({}) is not supported", args[0] as i32);
        return Err(SyscallError::FAILED);
    }
    let fsbase: u64 = guest::read(args[1])?;
    tracing::debug!("FSBASE=0x{:x}", fsbase);
    runtime.set_fsbase(fsbase);
    Ok(0)
}

/// mname(addr, len, name, arg4)
pub unsafe fn sys_mname(_runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    let name = guest::read_cstr(args[2]).unwrap_or_default();
    tracing::debug!("mname: 0x{:x}+0x{:x}={}", args[0], args[1], name);
    Ok(0)
}

/// get_authinfo(pid, info)
pub unsafe fn sys_get_authinfo(_runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    guest::fill(args[1], 0, AUTHINFO_SIZE)?;
    Ok(0)
}

/// mdbg_service(op, arg2, arg3)
pub unsafe fn sys_mdbg_service(_runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    if args[0] as u32 as u64 == MDBG_SERVICE_OP_1 {
        return Ok(0);
    }
    tracing::warn!("mdbg_service op {} is not supported", args[0] as u32);
    Err(SyscallError::FAILED)
}

/// randomized_path(set_path, path, path_length)
pub unsafe fn sys_randomized_path(_runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    if args[0] != 0 {
        return Err(SyscallError::FAILED);
    }
    let capacity: u64 = guest::read(args[2])?;
    let written = guest::write_cstr(args[1], capacity as usize, RANDOMIZED_PATH)?;
    guest::write(args[2], written as u64)?;
    Ok(0)
}

/// get_proc_type_info(info)
pub unsafe fn sys_get_proc_type_info(_runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    let info = ProcTypeInfo {
        struct_size: std::mem::size_of::<ProcTypeInfo>() as u64,
        budget: 0,
        flags: 0,
    };
    guest::write(args[0], info)?;
    Ok(0)
}

pub unsafe fn sys_workaround8849(_runtime: &Runtime, _args: [u64; 6]) -> SyscallResult {
    Ok(0)
}

/// regmgr_call(op, id, result, value, type)
pub unsafe fn sys_regmgr_call(_runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    if args[0] as u32 != REGMGR_GET_NONSYS_INT {
        tracing::warn!("regmgr_call op {} is not supported", args[0] as u32);
        return Err(SyscallError::FAILED);
    }

    let mut value: NonSystemInt = guest::read(args[3])?;
    if !REGMGR_KNOWN_KEYS.contains(&value.encoded_id) {
        tracing::debug!("regmgr_call: unknown key 0x{:016x}", value.encoded_id);
        return Err(SyscallError::Value(REGMGR_NOT_FOUND));
    }
    value.value = 0;
    guest::write(args[3], value)?;
    Ok(0)
}

/// sigprocmask(how, set, oset)
pub unsafe fn sys_sigprocmask(_runtime: &Runtime, _args: [u64; 6]) -> SyscallResult {
    Ok(0)
}

/// sigaction(sig, act, oact)
pub unsafe fn sys_sigaction(_runtime: &Runtime, _args: [u64; 6]) -> SyscallResult {
    Ok(0)
}

/// thr_self(id)
pub unsafe fn sys_thr_self(_runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    guest::write(args[0], THREAD_ID)?;
    Ok(THREAD_SELF_RESULT)
}

/// _umtx_op(obj, op, val, uaddr1, uaddr2)
pub unsafe fn sys_umtx_op(_runtime: &Runtime, _args: [u64; 6]) -> SyscallResult {
    Ok(0)
}

/// thr_set_name(id, name)
pub unsafe fn sys_thr_set_name(_runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    let name = guest::read_cstr(args[1]).unwrap_or_default();
    tracing::debug!("thr_set_name: {}={}", args[0] as u32, name);
    Ok(0)
}

/// rtprio_thread(function, lwpid, rtp)
pub unsafe fn sys_rtprio_thread(_runtime: &Runtime, _args: [u64; 6]) -> SyscallResult {
    Ok(0)
}

/// cpuset_getaffinity(level, which, id, setsize, mask)
pub unsafe fn sys_cpuset_getaffinity(_runtime: &Runtime, _args: [u64; 6]) -> SyscallResult {
    Ok(0)
}

/// thr_get_name(id, name)
pub unsafe fn sys_thr_get_name(_runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    let name = format!("thread_{}", args[0] as u32);
    guest::write_cstr(args[1], THREAD_NAME_CAPACITY, &name)?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::allocate_anonymous;
    use ob_core::{Config, Errno};

    fn ptr<T>(value: &mut T) -> u64 {
        value as *mut T as u64
    }

    #[test]
    fn test_sysarch_sets_fsbase() {
        let runtime = Runtime::new(Config::default());
        let mut fsbase = 0x7000_1000u64;
        assert_eq!(unsafe { sys_sysarch(&runtime, [129, ptr(&mut fsbase), 0, 0, 0, 0]) }, Ok(0));
        assert_eq!(runtime.fsbase(), 0x7000_1000);

        assert_eq!(unsafe { sys_sysarch(&runtime, [128, ptr(&mut fsbase), 0, 0, 0, 0]) }, Err(SyscallError::FAILED));
        assert_eq!(unsafe { sys_sysarch(&runtime, [129, 0, 0, 0, 0, 0]) }, Err(Errno::EINVAL.into()));
    }

    #[test]
    fn test_randomized_path() {
        let runtime = Runtime::new(Config::default());
        let mut buffer = [0xFFu8; 16];
        let mut length = buffer.len() as u64;
        let args = [0, buffer.as_mut_ptr() as u64, ptr(&mut length), 0, 0, 0];
        assert_eq!(unsafe { sys_randomized_path(&runtime, args) }, Ok(0));
        assert_eq!(&buffer[..7], b"uplift\0");
        assert_eq!(length, 6);

        let args = [0x1000, buffer.as_mut_ptr() as u64, ptr(&mut length), 0, 0, 0];
        assert_eq!(unsafe { sys_randomized_path(&runtime, args) }, Err(SyscallError::FAILED));
    }

    #[test]
    fn test_regmgr_known_and_unknown_keys() {
        let runtime = Runtime::new(Config::default());
        let mut value = NonSystemInt {
            encoded_id: REGMGR_KNOWN_KEYS[1],
            unknown: 0,
            value: 77,
        };
        assert_eq!(unsafe { sys_regmgr_call(&runtime, [25, 0, 0, ptr(&mut value), 0, 0]) }, Ok(0));
        assert_eq!(value.value, 0);

        value.encoded_id = 0x1234;
        value.value = 77;
        let result = unsafe { sys_regmgr_call(&runtime, [25, 0, 0, ptr(&mut value), 0, 0]) };
        assert_eq!(result, Err(SyscallError::Value(0x800D_0203)));
        assert_eq!(value.value, 77);

        let result = unsafe { sys_regmgr_call(&runtime, [24, 0, 0, ptr(&mut value), 0, 0]) };
        assert_eq!(result, Err(SyscallError::FAILED));
    }

    #[test]
    fn test_thread_queries() {
        let runtime = Runtime::new(Config::default());
        let mut id = 0u64;
        assert_eq!(unsafe { sys_thr_self(&runtime, [ptr(&mut id), 0, 0, 0, 0, 0]) }, Ok(135));
        assert_eq!(id, 357);

        let mut name = [0xFFu8; 32];
        let args = [42, name.as_mut_ptr() as u64, 0, 0, 0, 0];
        assert_eq!(unsafe { sys_thr_get_name(&runtime, args) }, Ok(0));
        assert_eq!(&name[..10], b"thread_42\0");
    }

    #[test]
    fn test_fixed_answers() {
        let runtime = Runtime::new(Config::default());
        assert_eq!(unsafe { sys_getpid(&runtime, [0; 6]) }, Ok(123));
        assert_eq!(unsafe { sys_exit(&runtime, [0; 6]) }, Err(SyscallError::FAILED));
        assert_eq!(unsafe { sys_mdbg_service(&runtime, [1, 0, 0, 0, 0, 0]) }, Ok(0));
        assert_eq!(unsafe { sys_mdbg_service(&runtime, [2, 0, 0, 0, 0, 0]) }, Err(SyscallError::FAILED));

        let mut info = ProcTypeInfo {
            struct_size: 0,
            budget: 9,
            flags: 9,
        };
        assert_eq!(unsafe { sys_get_proc_type_info(&runtime, [ptr(&mut info), 0, 0, 0, 0, 0]) }, Ok(0));
        assert_eq!((info.struct_size, info.budget, info.flags), (16, 0, 0));
    }

    #[test]
    fn test_get_authinfo_zeroes_buffer() {
        let runtime = Runtime::new(Config::default());
        let buffer = allocate_anonymous(0, 0x1000, false).unwrap();
        unsafe {
            guest::fill(buffer, 0xAA, 0x100).unwrap();
            assert_eq!(sys_get_authinfo(&runtime, [0, buffer, 0, 0, 0, 0]), Ok(0));
            let bytes = guest::read_bytes(buffer, 0x100).unwrap();
            assert!(bytes[..AUTHINFO_SIZE].iter().all(|&b| b == 0));
            assert!(bytes[AUTHINFO_SIZE..].iter().all(|&b| b == 0xAA));
        }
    }
}
