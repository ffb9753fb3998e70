//! Syscalls dispatched through the runtime's table

use ob_core::{Config, Errno};
use ob_kernel::exception::{self, X64Context};
use ob_kernel::syscall_numbers::*;
use ob_kernel::{Runtime, SyscallError};

#[test]
fn test_sysctl_usrstack() {
    let mut config = Config::default();
    config.memory.user_stack_size = 0x20000;
    let runtime = Runtime::new(config);
    let (_, end) = runtime.prepare_user_stack().unwrap();

    let oid = [1i32, 33];
    let mut value = 0u64;
    let mut len = 8u64;
    let args = [
        oid.as_ptr() as u64,
        2,
        &mut value as *mut u64 as u64,
        &mut len as *mut u64 as u64,
        0,
        0,
    ];
    assert_eq!(runtime.handle_syscall(SYS_SYSCTL, args), Ok(0));
    assert_eq!(value, end);
    assert_eq!(len, 8);
}

#[test]
fn test_errors_map_to_retvals() {
    let runtime = Runtime::new(Config::default());
    let result = runtime.handle_syscall(SYS_CLOSE, [0x400, 0, 0, 0, 0, 0]);
    assert_eq!(result, Err(SyscallError::Errno(Errno::EBADF)));
    assert_eq!(result.unwrap_err().retval(), Errno::EBADF.as_retval());
    assert_eq!(SyscallError::FAILED.retval(), u64::MAX);
}

#[test]
fn test_thread_ids_and_pid() {
    let runtime = Runtime::new(Config::default());
    assert_eq!(runtime.handle_syscall(SYS_GETPID, [0; 6]), Ok(123));

    let mut tid = 0u64;
    let args = [&mut tid as *mut u64 as u64, 0, 0, 0, 0, 0];
    assert_eq!(runtime.handle_syscall(SYS_THR_SELF, args), Ok(135));
    assert_eq!(tid, 357);
}

#[cfg(target_arch = "x86_64")]
#[test]
fn test_bmi1_andn_emulated() {
    // andn rax, rbx, rcx; ret
    let code = [
        0xC4, 0xE2, 0xE0, 0xF2, 0xC1, 0xC3, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90,
    ];
    let rip = code.as_ptr() as u64;
    let mut context = X64Context {
        rip,
        rflags: 0x202,
        ..Default::default()
    };
    context.gprs[3] = 0x0000_FFFF_0000_FFFF;
    context.gprs[1] = 0xDEAD_BEEF_CAFE_BABE;

    exception::set_bmi1_emulation(true);
    assert!(unsafe { exception::handle_illegal_instruction(&mut context) });
    assert_eq!(context.gprs[0], 0xDEAD_0000_CAFE_0000);
    assert_eq!(context.rip, rip + 5);
    assert_eq!(context.rflags & 0x8C1, 0x80);
}
