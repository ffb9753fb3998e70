//! Descriptor syscalls: write, open, close, ioctl

use super::{handle_arg, lookup};
use crate::guest;
use crate::objects::{Device, Object, ObjectKind, ObjectOps};
use crate::runtime::Runtime;
use crate::syscall::SyscallResult;
use ob_core::Errno;
use std::io::Write;

const STDOUT: u32 = 1;
const STDERR: u32 = 2;

/// Paths the guest probes that are known not to exist yet.
const UNSUPPORTED_FILES: &[&str] = &["/app0/sce_discmap.plt", "/app0/sce_discmap_patch.plt"];

const IOCTL_DIRECTIONS: [&str; 8] = ["!", "void", "out", "void+out", "in", "void+in", "out+in", "void+out+in"];

/// write(fd, buf, nbytes)
pub unsafe fn sys_write(runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    let fd = handle_arg(args[0]);
    let len = args[2] as usize;
    let data = if len == 0 { Vec::new() } else { guest::read_bytes(args[1], len)? };

    if fd == STDOUT || fd == STDERR {
        let mut stdout = std::io::stdout().lock();
        // Guest console output is best effort.
        let _ = stdout.write_all(&data);
        let _ = stdout.flush();
        return Ok(len as u64);
    }

    let object = lookup(runtime, fd)?;
    Ok(object.write(&data)? as u64)
}

/// open(path, flags, mode)
pub unsafe fn sys_open(runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    let path = guest::read_cstr(args[0])?;
    let flags = args[1] as u32;
    let mode = args[2] as u32;
    tracing::debug!("open: {}, {:x}, {:x}", path, flags, mode);

    if path.starts_with("/dev/") {
        let device = Device::open(&path, flags, mode)?;
        let handle = runtime.object_table().add(Object::new(ObjectKind::Device(device)))?;
        return Ok(handle as u64);
    }

    if !UNSUPPORTED_FILES.contains(&path.as_str()) {
        tracing::warn!("open of unsupported path {}", path);
    }
    Err(Errno::EBUSY.into())
}

/// close(fd)
pub unsafe fn sys_close(runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    let fd = handle_arg(args[0]);
    let object = lookup(runtime, fd)?;
    if let Err(e) = object.close() {
        tracing::debug!("close({}) of {:?}: {}", fd, object.object_type(), e);
    }
    runtime.object_table().release(fd)?;
    Ok(0)
}

/// Human-readable breakdown of an ioctl request code.
pub fn describe_ioctl(request: u32) -> String {
    let direction = IOCTL_DIRECTIONS[(request >> 29) as usize & 7];
    let group = ((request >> 8) & 0xFF) as u8;
    format!(
        "[{:x}] inout={}, group={}, num={}, len={}",
        request,
        direction,
        group as char,
        request & 0xFF,
        (request >> 16) & 0x1FFF
    )
}

/// ioctl(fd, request, argp)
pub unsafe fn sys_ioctl(runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    let fd = handle_arg(args[0]);
    let request = args[1] as u32;
    tracing::debug!("ioctl({}): {}", fd, describe_ioctl(request));

    let object = lookup(runtime, fd)?;
    object.ioctl(request, args[2])?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::ObjectType;
    use ob_core::Config;
    use std::ffi::CString;

    fn open(runtime: &Runtime, path: &str) -> SyscallResult {
        let path = CString::new(path).unwrap();
        unsafe { sys_open(runtime, [path.as_ptr() as u64, 2, 0, 0, 0, 0]) }
    }

    #[test]
    fn test_open_devices() {
        let runtime = Runtime::new(Config::default());
        let handle = open(&runtime, "/dev/dipsw").unwrap() as u32;
        let object = runtime.object_table().lookup(handle).unwrap();
        assert_eq!(object.object_type(), ObjectType::Device);

        assert_eq!(open(&runtime, "/dev/camera"), Err(Errno::ENOENT.into()));
        assert_eq!(open(&runtime, "/app0/sce_discmap.plt"), Err(Errno::EBUSY.into()));
        assert_eq!(open(&runtime, "/app0/data.bin"), Err(Errno::EBUSY.into()));
        assert_eq!(unsafe { sys_open(&runtime, [0; 6]) }, Err(Errno::EINVAL.into()));
    }

    #[test]
    fn test_close_releases_handle() {
        let runtime = Runtime::new(Config::default());
        let handle = open(&runtime, "/dev/console").unwrap();
        assert_eq!(unsafe { sys_close(&runtime, [handle, 0, 0, 0, 0, 0]) }, Ok(0));
        assert!(runtime.object_table().lookup(handle as u32).is_none());
        assert_eq!(unsafe { sys_close(&runtime, [handle, 0, 0, 0, 0, 0]) }, Err(Errno::EBADF.into()));
    }

    #[test]
    fn test_write_to_console_and_bad_fd() {
        let runtime = Runtime::new(Config::default());
        let text = b"hello\n";
        let result = unsafe { sys_write(&runtime, [1, text.as_ptr() as u64, text.len() as u64, 0, 0, 0]) };
        assert_eq!(result, Ok(6));
        let result = unsafe { sys_write(&runtime, [40, text.as_ptr() as u64, 1, 0, 0, 0]) };
        assert_eq!(result, Err(Errno::EBADF.into()));
    }

    #[test]
    fn test_ioctl_dispatch() {
        let runtime = Runtime::new(Config::default());
        let handle = open(&runtime, "/dev/dipsw").unwrap();
        let mut value = 7u32;
        let argp = &mut value as *mut u32 as u64;
        let result = unsafe { sys_ioctl(&runtime, [handle, 0x4004_8806, argp, 0, 0, 0]) };
        assert_eq!(result, Ok(0));
        assert_eq!(value, 1);
        assert_eq!(unsafe { sys_ioctl(&runtime, [999, 0, 0, 0, 0, 0]) }, Err(Errno::EBADF.into()));
    }

    #[test]
    fn test_describe_ioctl() {
        assert_eq!(
            describe_ioctl(0xC008_811B),
            "[c008811b] inout=out+in, group=\u{81}, num=27, len=8"
        );
        assert_eq!(describe_ioctl(0x4004_8806), "[40048806] inout=out, group=\u{88}, num=6, len=4");
    }
}
