//! Clock syscalls

use crate::guest;
use crate::runtime::Runtime;
use crate::syscall::{SyscallError, SyscallResult};
use bytemuck::{Pod, Zeroable};
use ob_core::Errno;
use once_cell::sync::Lazy;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub const CLOCK_REALTIME: u32 = 0;
pub const CLOCK_MONOTONIC: u32 = 4;

/// Origin of the monotonic clock.
static MONOTONIC_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Timespec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

impl From<Duration> for Timespec {
    fn from(duration: Duration) -> Self {
        Self {
            tv_sec: duration.as_secs() as i64,
            tv_nsec: duration.subsec_nanos() as i64,
        }
    }
}

/// Read `clock_id`.
pub fn clock_time(clock_id: u32) -> Result<Timespec, Errno> {
    match clock_id {
        CLOCK_REALTIME => {
            let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
            Ok(now.into())
        }
        CLOCK_MONOTONIC => Ok(MONOTONIC_EPOCH.elapsed().into()),
        _ => {
            tracing::warn!("clock_gettime: unsupported clock {}", clock_id);
            Err(Errno::EINVAL)
        }
    }
}

/// gettimeofday(tp, tzp)
pub unsafe fn sys_gettimeofday(_runtime: &Runtime, _args: [u64; 6]) -> SyscallResult {
    Err(SyscallError::FAILED)
}

/// clock_gettime(clock_id, tp)
pub unsafe fn sys_clock_gettime(_runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    let time = clock_time(args[0] as u32)?;
    guest::write(args[1], time)?;
    Ok(0)
}

/// utc_to_localtime(time, local_time, timezone, dst)
///
/// The host timezone is not consulted; local time is UTC.
pub unsafe fn sys_utc_to_localtime(_runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    if args[1] != 0 {
        guest::write(args[1], args[0])?;
    }
    if args[2] != 0 {
        guest::fill(args[2], 0, 16)?;
    }
    if args[3] != 0 {
        guest::write(args[3], 0u32)?;
    }
    Ok(0)
}
