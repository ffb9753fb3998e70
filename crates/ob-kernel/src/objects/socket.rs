//! Internet sockets
//!
//! Sockets wrap a host socket so the guest can hold one, but no traffic
//! flows: connect is refused and reads and writes are unsupported.

use super::ObjectOps;
use ob_core::Errno;
use parking_lot::Mutex;

/// Address families
pub mod domain {
    pub const IPV4: u32 = 2;
}

/// Socket types
pub mod socket_type {
    pub const STREAM: u32 = 1;
    pub const DATAGRAM: u32 = 2;
    pub const DATAGRAM_P2P: u32 = 6;
}

/// Protocols
pub mod protocol {
    pub const DEFAULT: u32 = 0;
    pub const TCP: u32 = 6;
    pub const UDP: u32 = 17;
}

/// Socket subsystem initialization request issued by libnet.
pub const IOCTL_INIT: u32 = 0x8024_50C9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NativeKind {
    Stream,
    Datagram,
}

fn translate(socket_type: u32, proto: u32) -> Option<NativeKind> {
    match (socket_type, proto) {
        (socket_type::STREAM, protocol::DEFAULT | protocol::TCP) => Some(NativeKind::Stream),
        (socket_type::DATAGRAM | socket_type::DATAGRAM_P2P, protocol::DEFAULT | protocol::UDP) => {
            Some(NativeKind::Datagram)
        }
        _ => None,
    }
}

#[derive(Debug)]
pub struct Socket {
    socket_type: u32,
    protocol: u32,
    native: Mutex<Option<native::Handle>>,
}

impl Socket {
    pub fn new(domain: u32, socket_type: u32, protocol: u32) -> Result<Self, Errno> {
        if domain != domain::IPV4 {
            return Err(Errno::EINVAL);
        }
        let kind = translate(socket_type, protocol).ok_or(Errno::EINVAL)?;
        let handle = native::open(kind).ok_or(Errno::ENOMEM)?;
        Ok(Self {
            socket_type,
            protocol,
            native: Mutex::new(Some(handle)),
        })
    }

    pub fn socket_type(&self) -> u32 {
        self.socket_type
    }

    pub fn protocol(&self) -> u32 {
        self.protocol
    }

    pub fn connect(&self, _name: &[u8]) -> Result<(), Errno> {
        Err(Errno::EINVAL)
    }
}

impl ObjectOps for Socket {
    fn close(&self) -> Result<(), Errno> {
        match self.native.lock().take() {
            Some(handle) if native::close(handle) => Ok(()),
            Some(_) => Err(Errno::EIO),
            None => Ok(()),
        }
    }

    unsafe fn ioctl(&self, request: u32, _argp: u64) -> Result<(), Errno> {
        match request {
            IOCTL_INIT => Ok(()),
            _ => {
                tracing::warn!("Unhandled socket ioctl 0x{:08x}", request);
                Err(Errno::ENODEV)
            }
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if let Some(handle) = self.native.get_mut().take() {
            native::close(handle);
        }
    }
}

#[cfg(unix)]
mod native {
    use super::NativeKind;

    pub type Handle = libc::c_int;

    pub fn open(kind: NativeKind) -> Option<Handle> {
        let (ty, proto) = match kind {
            NativeKind::Stream => (libc::SOCK_STREAM, libc::IPPROTO_TCP),
            NativeKind::Datagram => (libc::SOCK_DGRAM, libc::IPPROTO_UDP),
        };
        let fd = unsafe { libc::socket(libc::AF_INET, ty, proto) };
        (fd >= 0).then_some(fd)
    }

    pub fn close(handle: Handle) -> bool {
        unsafe { libc::close(handle) == 0 }
    }
}

#[cfg(windows)]
mod native {
    use super::NativeKind;
    use std::sync::Once;
    use windows_sys::Win32::Networking::WinSock::{
        closesocket, socket, WSAStartup, AF_INET, INVALID_SOCKET, IPPROTO_TCP, IPPROTO_UDP,
        SOCKET, SOCK_DGRAM, SOCK_STREAM, WSADATA,
    };

    pub type Handle = SOCKET;

    fn startup() {
        static STARTUP: Once = Once::new();
        STARTUP.call_once(|| unsafe {
            let mut data: WSADATA = std::mem::zeroed();
            let result = WSAStartup(0x0202, &mut data);
            if result != 0 {
                tracing::warn!("WSAStartup failed: {}", result);
            }
        });
    }

    pub fn open(kind: NativeKind) -> Option<Handle> {
        startup();
        let (ty, proto) = match kind {
            NativeKind::Stream => (SOCK_STREAM as i32, IPPROTO_TCP as i32),
            NativeKind::Datagram => (SOCK_DGRAM as i32, IPPROTO_UDP as i32),
        };
        let handle = unsafe { socket(AF_INET as i32, ty, proto) };
        (handle != INVALID_SOCKET).then_some(handle)
    }

    pub fn close(handle: Handle) -> bool {
        unsafe { closesocket(handle) == 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate() {
        assert_eq!(translate(socket_type::STREAM, protocol::DEFAULT), Some(NativeKind::Stream));
        assert_eq!(translate(socket_type::DATAGRAM_P2P, protocol::DEFAULT), Some(NativeKind::Datagram));
        assert_eq!(translate(socket_type::STREAM, protocol::UDP), None);
        assert_eq!(translate(3, protocol::DEFAULT), None);
    }

    #[test]
    fn test_ipv4_only() {
        assert!(matches!(Socket::new(28, socket_type::STREAM, 0), Err(Errno::EINVAL)));
    }

    #[test]
    fn test_socket_surface() {
        let socket = Socket::new(domain::IPV4, socket_type::DATAGRAM, protocol::DEFAULT).unwrap();
        assert_eq!(socket.connect(&[0u8; 16]), Err(Errno::EINVAL));
        assert_eq!(unsafe { socket.ioctl(IOCTL_INIT, 0) }, Ok(()));
        assert_eq!(unsafe { socket.ioctl(0x8004_667E, 0) }, Err(Errno::ENODEV));
        assert_eq!(socket.write(b"x"), Err(Errno::ENODEV));
        assert_eq!(socket.close(), Ok(()));
        assert_eq!(socket.close(), Ok(()));
    }
}
