//! sysctl
//!
//! Only the OIDs libkernel and libc query during startup are known. Names
//! without a fixed OID are translated (`{0, 3}`) into synthetic OIDs under
//! [`SYNTHETIC_ROOT`].

use crate::guest;
use crate::runtime::Runtime;
use crate::syscall::SyscallResult;
use ob_core::Errno;

const CTL_MAXNAME: usize = 24;

const CTL_UNSPEC: i32 = 0;
const CTL_KERN: i32 = 1;
const CTL_HW: i32 = 6;

const SYSCTL_NAME2OID: i32 = 3;
const KERN_PROC: i32 = 14;
const KERN_USRSTACK: i32 = 33;
const KERN_ARND: i32 = 37;
const HW_PAGESIZE: i32 = 7;

/// Root of the OIDs handed out by name translation.
pub const SYNTHETIC_ROOT: i32 = 0x0BAD_F00D;

const ARND_MAX: usize = 256;
const ARND_FILL: u8 = 4;

/// Names with a synthetic OID, numbered from 1.
const SYNTHETIC_NAMES: [&str; 4] = ["kern.smp.cpus", "kern.proc.ptc", "machdep.tsc_freq", "kern.sched.cpusetsize"];

const CPU_COUNT: u32 = 1;
const PROC_PTC: u64 = 1357;
const TSC_FREQUENCY: u64 = 16_000_000_000;
const CPUSET_SIZE: u32 = 8;
const PAGE_SIZE: u32 = 4096;

fn read_oid(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Store `value` in the caller's old buffer and report its length.
unsafe fn write_old(oldp: u64, oldlenp: u64, value: &[u8]) -> SyscallResult {
    let capacity: u64 = guest::read(oldlenp)?;
    if (capacity as usize) < value.len() {
        return Err(Errno::ENOMEM.into());
    }
    guest::write_bytes(oldp, value)?;
    guest::write(oldlenp, value.len() as u64)?;
    Ok(0)
}

unsafe fn name_to_oid(name: &str, oldp: u64, oldlenp: u64) -> SyscallResult {
    if let Some(index) = SYNTHETIC_NAMES.iter().position(|n| *n == name) {
        let oid = [SYNTHETIC_ROOT as u32, index as u32 + 1];
        return write_old(oldp, oldlenp, bytemuck::cast_slice(&oid));
    }
    if name.starts_with("vm.ps4dev.") {
        // Development kit only.
        return Err(Errno::ENOENT.into());
    }
    tracing::warn!("sysctl: unknown name {}", name);
    Err(Errno::ENOENT.into())
}

/// sysctl(name, namelen, oldp, oldlenp, newp, newlen)
pub unsafe fn sys_sysctl(runtime: &Runtime, args: [u64; 6]) -> SyscallResult {
    let [name, namelen, oldp, oldlenp, newp, newlen] = args;
    let namelen = namelen as usize;
    if namelen == 0 || namelen > CTL_MAXNAME {
        return Err(Errno::EINVAL.into());
    }
    let oid = read_oid(&guest::read_bytes(name, namelen * 4)?);

    match oid.as_slice() {
        [CTL_UNSPEC, SYSCTL_NAME2OID] => {
            let bytes = guest::read_bytes(newp, newlen as usize)?;
            let name = String::from_utf8_lossy(&bytes);
            name_to_oid(name.trim_end_matches('\0'), oldp, oldlenp)
        }
        [CTL_KERN, KERN_USRSTACK] => write_old(oldp, oldlenp, &runtime.user_stack_end().to_le_bytes()),
        [CTL_KERN, KERN_ARND] => {
            let length = (guest::read::<u64>(oldlenp)? as usize).min(ARND_MAX);
            write_old(oldp, oldlenp, &vec![ARND_FILL; length])
        }
        [CTL_KERN, KERN_PROC, 35, _] => write_old(oldp, oldlenp, &[0; 72]),
        [CTL_KERN, KERN_PROC, 41] => write_old(oldp, oldlenp, &0u32.to_le_bytes()),
        [CTL_KERN, KERN_PROC, 44, _] => write_old(oldp, oldlenp, &[0; 16]),
        [CTL_HW, HW_PAGESIZE] => write_old(oldp, oldlenp, &PAGE_SIZE.to_le_bytes()),
        [SYNTHETIC_ROOT, 1] => write_old(oldp, oldlenp, &CPU_COUNT.to_le_bytes()),
        [SYNTHETIC_ROOT, 2] => write_old(oldp, oldlenp, &PROC_PTC.to_le_bytes()),
        [SYNTHETIC_ROOT, 3] => write_old(oldp, oldlenp, &TSC_FREQUENCY.to_le_bytes()),
        [SYNTHETIC_ROOT, 4] => write_old(oldp, oldlenp, &CPUSET_SIZE.to_le_bytes()),
        _ => {
            tracing::warn!("sysctl: unknown oid {:?}", oid);
            Err(Errno::ENOENT.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ob_core::Config;

    struct Query {
        oid: Vec<i32>,
        old: Vec<u8>,
        oldlen: u64,
    }

    impl Query {
        fn new(oid: &[i32], capacity: usize) -> Self {
            Self {
                oid: oid.to_vec(),
                old: vec![0xEE; capacity],
                oldlen: capacity as u64,
            }
        }

        fn run(&mut self, runtime: &Runtime, new: &[u8]) -> SyscallResult {
            let args = [
                self.oid.as_ptr() as u64,
                self.oid.len() as u64,
                self.old.as_mut_ptr() as u64,
                &mut self.oldlen as *mut u64 as u64,
                new.as_ptr() as u64,
                new.len() as u64,
            ];
            unsafe { sys_sysctl(runtime, args) }
        }
    }

    #[test]
    fn test_usrstack() {
        let mut config = Config::default();
        config.memory.user_stack_size = 0x10000;
        let runtime = Runtime::new(config);
        let (_, end) = runtime.prepare_user_stack().unwrap();

        let mut query = Query::new(&[1, 33], 8);
        assert_eq!(query.run(&runtime, &[]), Ok(0));
        assert_eq!(query.oldlen, 8);
        assert_eq!(u64::from_le_bytes(query.old[..8].try_into().unwrap()), end);
    }

    #[test]
    fn test_name_translation_then_query() {
        let runtime = Runtime::new(Config::default());
        let mut query = Query::new(&[0, 3], 8);
        assert_eq!(query.run(&runtime, b"machdep.tsc_freq"), Ok(0));
        assert_eq!(query.oldlen, 8);
        let oid = read_oid(&query.old);
        assert_eq!(oid, vec![SYNTHETIC_ROOT, 3]);

        let mut query = Query::new(&oid, 8);
        assert_eq!(query.run(&runtime, &[]), Ok(0));
        assert_eq!(u64::from_le_bytes(query.old[..8].try_into().unwrap()), 16_000_000_000);

        let mut query = Query::new(&[SYNTHETIC_ROOT, 1], 4);
        assert_eq!(query.run(&runtime, &[]), Ok(0));
        assert_eq!(query.old, 1u32.to_le_bytes());
    }

    #[test]
    fn test_devkit_names_are_missing() {
        let runtime = Runtime::new(Config::default());
        let mut query = Query::new(&[0, 3], 8);
        assert_eq!(query.run(&runtime, b"vm.ps4dev.trcmem_total"), Err(Errno::ENOENT.into()));
        assert_eq!(query.run(&runtime, b"kern.unknown"), Err(Errno::ENOENT.into()));
    }

    #[test]
    fn test_arnd_is_capped() {
        let runtime = Runtime::new(Config::default());
        let mut query = Query::new(&[1, 37], 300);
        assert_eq!(query.run(&runtime, &[]), Ok(0));
        assert_eq!(query.oldlen, 256);
        assert!(query.old[..256].iter().all(|&b| b == 4));
        assert!(query.old[256..].iter().all(|&b| b == 0xEE));
    }

    #[test]
    fn test_fixed_oids() {
        let runtime = Runtime::new(Config::default());
        let mut query = Query::new(&[6, 7], 4);
        assert_eq!(query.run(&runtime, &[]), Ok(0));
        assert_eq!(query.old, 4096u32.to_le_bytes());

        let mut query = Query::new(&[1, 14, 35, 123], 72);
        assert_eq!(query.run(&runtime, &[]), Ok(0));
        assert!(query.old.iter().all(|&b| b == 0));

        let mut query = Query::new(&[1, 14, 44, 123], 8);
        assert_eq!(query.run(&runtime, &[]), Err(Errno::ENOMEM.into()));
    }

    #[test]
    fn test_unknown_oid() {
        let runtime = Runtime::new(Config::default());
        let mut query = Query::new(&[1, 99], 8);
        assert_eq!(query.run(&runtime, &[]), Err(Errno::ENOENT.into()));
        let mut query = Query::new(&[], 8);
        assert_eq!(query.run(&runtime, &[]), Err(Errno::EINVAL.into()));
    }
}
