//! `/dev` nodes
//!
//! Devices exist only so system libraries get past their start-up probes.
//! Each ioctl either writes the constant those libraries expect or fails.

use super::{MapRequest, ObjectOps};
use crate::guest;
use crate::memory::{allocate_anonymous, map_flags};
use ob_core::Errno;
use std::io::Write;

/// Value reported for direct-memory sizes and allocations.
pub const DIRECT_MEMORY_MAGIC: u64 = 0xBADC_0FFE_E0DD_F00D;

/// Bytes preceding the text of a notification write.
const NOTIFICATION_HEADER_SIZE: usize = 0x28;

/// ioctl request codes
pub mod ioctl {
    pub const DIPSW_CHECK_1: u32 = 0x4004_8806;
    pub const DIPSW_CHECK_2: u32 = 0x4004_8807;
    pub const DIPSW_QUERY_1: u32 = 0x4008_8808;
    pub const DIPSW_QUERY_2: u32 = 0x4008_8809;

    pub const DMEM_GET_SIZE: u32 = 0x4008_800A;
    pub const DMEM_ALLOCATE: u32 = 0xC028_8001;

    pub const GC_GET_INFO: u32 = 0xC008_811B;
    pub const GC_SET_GS_RING_SIZES: u32 = 0xC00C_8110;
    pub const GC_SUBMIT: u32 = 0xC084_8119;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Console,
    DeciTty,
    Dipsw,
    DirectMemory,
    Gc,
    Notification,
}

impl DeviceKind {
    /// Map a `/dev/...` path to a device.
    pub fn from_path(path: &str) -> Option<Self> {
        let name = path.strip_prefix("/dev/")?;
        match name {
            "console" => Some(Self::Console),
            "deci_tty6" => Some(Self::DeciTty),
            "dipsw" => Some(Self::Dipsw),
            "gc" => Some(Self::Gc),
            _ if name.starts_with("dmem") => Some(Self::DirectMemory),
            _ if name.starts_with("notification") => Some(Self::Notification),
            _ => None,
        }
    }
}

/// `DMEM_ALLOCATE` argument block.
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct DirectMemoryAllocation {
    allocation: u64,
    search_start: u64,
    size: u64,
    alignment: u64,
    memory_type: u32,
    _pad: u32,
}

#[derive(Debug)]
pub struct Device {
    kind: DeviceKind,
    path: String,
    flags: u32,
    mode: u32,
}

impl Device {
    pub fn open(path: &str, flags: u32, mode: u32) -> Result<Self, Errno> {
        let kind = DeviceKind::from_path(path).ok_or(Errno::ENOENT)?;
        Ok(Self {
            kind,
            path: path.to_string(),
            flags,
            mode,
        })
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    unsafe fn dipsw_ioctl(request: u32, argp: u64) -> Result<(), Errno> {
        match request {
            ioctl::DIPSW_CHECK_1 => guest::write(argp, 1u32),
            ioctl::DIPSW_CHECK_2 => guest::write(argp, 0u32),
            ioctl::DIPSW_QUERY_1 | ioctl::DIPSW_QUERY_2 => guest::write(argp, 0u64),
            _ => Err(Errno::EINVAL),
        }
    }

    unsafe fn direct_memory_ioctl(request: u32, argp: u64) -> Result<(), Errno> {
        match request {
            ioctl::DMEM_GET_SIZE => guest::write(argp, DIRECT_MEMORY_MAGIC),
            ioctl::DMEM_ALLOCATE => {
                let mut args: DirectMemoryAllocation = guest::read(argp)?;
                tracing::debug!(
                    "Direct memory allocation: size=0x{:x} align=0x{:x} type={}",
                    args.size,
                    args.alignment,
                    args.memory_type
                );
                args.allocation = DIRECT_MEMORY_MAGIC;
                guest::write(argp, args)
            }
            _ => Err(Errno::ENOSYS),
        }
    }

    unsafe fn gc_ioctl(request: u32, argp: u64) -> Result<(), Errno> {
        match request {
            ioctl::GC_GET_INFO => {
                let previous: u64 = guest::read(argp)?;
                tracing::debug!("gc ioctl 0x{:08x}: 0x{:x}", request, previous);
                guest::write(argp, 0x1234_FFFF_0000_0000u64)
            }
            ioctl::GC_SET_GS_RING_SIZES => {
                let sizes: [u32; 3] = guest::read(argp)?;
                tracing::debug!("gc ioctl 0x{:08x}: {:x?}", request, sizes);
                Ok(())
            }
            ioctl::GC_SUBMIT => {
                let header: [u32; 4] = guest::read(argp)?;
                tracing::debug!("gc ioctl 0x{:08x}: {:x?}", request, header);
                Ok(())
            }
            _ => Err(Errno::ENOSYS),
        }
    }
}

fn print_guest_text(data: &[u8]) {
    let mut stdout = std::io::stdout().lock();
    // Console output is best effort.
    let _ = stdout.write_all(data);
    let _ = stdout.flush();
}

impl ObjectOps for Device {
    fn close(&self) -> Result<(), Errno> {
        Ok(())
    }

    fn write(&self, data: &[u8]) -> Result<usize, Errno> {
        match self.kind {
            DeviceKind::Console | DeviceKind::DeciTty => {
                print_guest_text(data);
                Ok(data.len())
            }
            DeviceKind::Notification => {
                if data.len() > NOTIFICATION_HEADER_SIZE {
                    let text = &data[NOTIFICATION_HEADER_SIZE..];
                    let end = text.iter().position(|&b| b == 0).unwrap_or(text.len());
                    print_guest_text(&text[..end]);
                    print_guest_text(b"\n");
                }
                Ok(data.len())
            }
            DeviceKind::Dipsw | DeviceKind::DirectMemory | DeviceKind::Gc => Err(Errno::ENOSYS),
        }
    }

    unsafe fn ioctl(&self, request: u32, argp: u64) -> Result<(), Errno> {
        match self.kind {
            DeviceKind::Console | DeviceKind::DeciTty => Ok(()),
            DeviceKind::Dipsw => Self::dipsw_ioctl(request, argp),
            DeviceKind::DirectMemory => Self::direct_memory_ioctl(request, argp),
            DeviceKind::Gc => Self::gc_ioctl(request, argp),
            DeviceKind::Notification => Err(Errno::ENOSYS),
        }
    }

    fn mmap(&self, request: &MapRequest) -> Result<u64, Errno> {
        match self.kind {
            DeviceKind::Gc => {
                let allowed = map_flags::SHARED
                    | map_flags::PRIVATE
                    | map_flags::FIXED
                    | map_flags::ANONYMOUS
                    | map_flags::SYSTEM;
                if request.flags & !allowed != 0 {
                    return Err(Errno::EINVAL);
                }
                allocate_anonymous(request.addr, request.len, request.flags & map_flags::FIXED != 0)
            }
            _ => Err(Errno::ENOSYS),
        }
    }
}
