//! Socket syscalls

use super::{fs, handle_arg, lookup_typed};
use crate::guest;
use crate::objects::{Object, ObjectKind, ObjectType, Socket};
use crate::runtime::Runtime;
use crate::syscall::SyscallResult;
use ob_core::Errno;

const MAX_SOCKADDR_LEN: u32 = 255;
const MAX_NETCONTROL_DATA: u32 = 160;
const NETCONTROL_BNET_GET_SECURE_SEED: u32 = 20;
const SECURE_SEED: u32 = 4;

fn create_socket(runtime: &Runtime, domain: u32, socket_type: u32, protocol: u32) -> SyscallResult {
    let socket = Socket::new(domain, socket_type, protocol)?;
    let handle = runtime
        .object_table()
        .add(Object::new(ObjectKind::Socket(socket)))?;
    Ok(handle as u64)
}

/// socket(domain, type, protocol)
pub unsafe fn sys_socket(runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    create_socket(runtime, args[0] as u32, args[1] as u32, args[2] as u32)
}

/// connect(s, name, namelen)
pub unsafe fn sys_connect(runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    let namelen = args[2] as u32;
    if namelen > MAX_SOCKADDR_LEN {
        return Err(Errno::ENAMETOOLONG.into());
    }
    let object = lookup_typed(runtime, handle_arg(args[0]), ObjectType::Socket).ok_or(Errno::EBADF)?;
    let socket = object.as_socket().ok_or(Errno::EBADF)?;
    let name = if namelen == 0 { Vec::new() } else { guest::read_bytes(args[1], namelen as usize)? };
    socket.connect(&name)?;
    Ok(0)
}

/// socketex(name, domain, type, protocol)
pub unsafe fn sys_socketex(runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    let name = guest::read_cstr(args[0])?;
    let handle = create_socket(runtime, args[1] as u32, args[2] as u32, args[3] as u32)?;
    if let Err(e) = runtime.object_table().add_name(&name, handle as u32) {
        tracing::warn!("socketex: could not name socket {}: {}", name, e);
    }
    Ok(handle)
}

/// socketclose(s)
pub unsafe fn sys_socketclose(runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    fs::sys_close(runtime, args)
}

/// netcontrol(fd, op, buffer, size)
pub unsafe fn sys_netcontrol(_runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    let op = args[1] as u32;
    let size = args[3] as u32;
    if size > MAX_NETCONTROL_DATA {
        return Err(Errno::EINVAL.into());
    }

    match op {
        NETCONTROL_BNET_GET_SECURE_SEED => {
            guest::write(args[2], SECURE_SEED)?;
            Ok(0)
        }
        _ => {
            tracing::warn!("netcontrol op {} is not supported", op);
            Err(Errno::EINVAL.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::socket::{domain, protocol, socket_type};
    use ob_core::Config;
    use std::ffi::CString;

    #[test]
    fn test_socket_lifecycle() {
        let runtime = Runtime::new(Config::default());
        let args = [domain::IPV4 as u64, socket_type::STREAM as u64, protocol::TCP as u64, 0, 0, 0];
        let handle = unsafe { sys_socket(&runtime, args) }.unwrap();
        assert!(runtime.object_table().lookup_typed(handle as u32, ObjectType::Socket).is_some());

        let address = [0u8; 16];
        let connect = [handle, address.as_ptr() as u64, 16, 0, 0, 0];
        assert_eq!(unsafe { sys_connect(&runtime, connect) }, Err(Errno::EINVAL.into()));
        let connect = [handle, address.as_ptr() as u64, 256, 0, 0, 0];
        assert_eq!(unsafe { sys_connect(&runtime, connect) }, Err(Errno::ENAMETOOLONG.into()));

        assert_eq!(unsafe { sys_socketclose(&runtime, [handle, 0, 0, 0, 0, 0]) }, Ok(0));
        assert!(runtime.object_table().lookup(handle as u32).is_none());
    }

    #[test]
    fn test_socket_rejects_other_domains() {
        let runtime = Runtime::new(Config::default());
        let args = [10, socket_type::STREAM as u64, protocol::TCP as u64, 0, 0, 0];
        assert_eq!(unsafe { sys_socket(&runtime, args) }, Err(Errno::EINVAL.into()));
        let args = [domain::IPV4 as u64, socket_type::STREAM as u64, protocol::UDP as u64, 0, 0, 0];
        assert_eq!(unsafe { sys_socket(&runtime, args) }, Err(Errno::EINVAL.into()));
    }

    #[test]
    fn test_connect_requires_socket() {
        let runtime = Runtime::new(Config::default());
        let path = CString::new("/dev/console").unwrap();
        let console = unsafe { fs::sys_open(&runtime, [path.as_ptr() as u64, 0, 0, 0, 0, 0]) }.unwrap();
        let address = [0u8; 16];
        let connect = [console, address.as_ptr() as u64, 16, 0, 0, 0];
        assert_eq!(unsafe { sys_connect(&runtime, connect) }, Err(Errno::EBADF.into()));
    }

    #[test]
    fn test_socketex_names_socket() {
        let runtime = Runtime::new(Config::default());
        let name = CString::new("SceNpTcpSocket").unwrap();
        let args = [
            name.as_ptr() as u64,
            domain::IPV4 as u64,
            socket_type::DATAGRAM_P2P as u64,
            protocol::UDP as u64,
            0,
            0,
        ];
        let handle = unsafe { sys_socketex(&runtime, args) }.unwrap() as u32;
        assert_eq!(runtime.object_table().lookup_by_name("scenptcpsocket"), Some(handle));
    }

    #[test]
    fn test_netcontrol() {
        let runtime = Runtime::new(Config::default());
        let mut seed = 0u32;
        let buffer = &mut seed as *mut u32 as u64;
        assert_eq!(unsafe { sys_netcontrol(&runtime, [u64::MAX, 20, buffer, 4, 0, 0]) }, Ok(0));
        assert_eq!(seed, 4);
        assert_eq!(unsafe { sys_netcontrol(&runtime, [u64::MAX, 20, buffer, 161, 0, 0]) }, Err(Errno::EINVAL.into()));
        assert_eq!(unsafe { sys_netcontrol(&runtime, [u64::MAX, 3, buffer, 4, 0, 0]) }, Err(Errno::EINVAL.into()));
    }
}
