//! SIGILL handler

use super::{handle_illegal_instruction, X64Context};
use libc::{c_int, c_void, siginfo_t, ucontext_t};
use ob_core::error::KernelError;
use once_cell::sync::OnceCell;

/// `gregs` slots in encoding order.
const GPR_SLOTS: [c_int; 16] = [
    libc::REG_RAX,
    libc::REG_RCX,
    libc::REG_RDX,
    libc::REG_RBX,
    libc::REG_RSP,
    libc::REG_RBP,
    libc::REG_RSI,
    libc::REG_RDI,
    libc::REG_R8,
    libc::REG_R9,
    libc::REG_R10,
    libc::REG_R11,
    libc::REG_R12,
    libc::REG_R13,
    libc::REG_R14,
    libc::REG_R15,
];

/// Action in place before ours, restored for faults we do not handle.
static PREVIOUS: OnceCell<libc::sigaction> = OnceCell::new();

unsafe fn capture(context: &ucontext_t) -> X64Context {
    let gregs = &context.uc_mcontext.gregs;
    let mut x64 = X64Context {
        rip: gregs[libc::REG_RIP as usize] as u64,
        rflags: gregs[libc::REG_EFL as usize] as u64,
        ..Default::default()
    };
    for (value, slot) in x64.gprs.iter_mut().zip(GPR_SLOTS) {
        *value = gregs[slot as usize] as u64;
    }
    x64
}

unsafe fn restore(x64: &X64Context, context: &mut ucontext_t) {
    let gregs = &mut context.uc_mcontext.gregs;
    for (value, slot) in x64.gprs.iter().zip(GPR_SLOTS) {
        gregs[slot as usize] = *value as i64;
    }
    gregs[libc::REG_RIP as usize] = x64.rip as i64;
    gregs[libc::REG_EFL as usize] = x64.rflags as i64;
}

extern "C" fn on_sigill(_signal: c_int, _info: *mut siginfo_t, context: *mut c_void) {
    // Safety: installed with SA_SIGINFO, so the third argument is the
    // interrupted thread's ucontext.
    unsafe {
        let context = &mut *(context as *mut ucontext_t);
        let mut x64 = capture(context);
        if handle_illegal_instruction(&mut x64) {
            restore(&x64, context);
            return;
        }

        // Returning re-executes the instruction under the previous action.
        if let Some(previous) = PREVIOUS.get() {
            libc::sigaction(libc::SIGILL, previous, std::ptr::null_mut());
        }
    }
}

pub fn install() -> Result<(), KernelError> {
    // Safety: plain sigaction setup on zeroed structs.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_sigill as usize;
        action.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut action.sa_mask);

        let mut previous: libc::sigaction = std::mem::zeroed();
        if libc::sigaction(libc::SIGILL, &action, &mut previous) != 0 {
            return Err(KernelError::ExceptionHook(std::io::Error::last_os_error().to_string()));
        }
        let _ = PREVIOUS.set(previous);
    }
    tracing::debug!("SIGILL handler installed");
    Ok(())
}
