//! Vectored exception handler

use super::{handle_illegal_instruction, X64Context};
use ob_core::error::KernelError;
use windows_sys::Win32::System::Diagnostics::Debug::{AddVectoredExceptionHandler, CONTEXT, EXCEPTION_POINTERS};

const EXCEPTION_ILLEGAL_INSTRUCTION: i32 = 0xC000_001Du32 as i32;
const EXCEPTION_CONTINUE_EXECUTION: i32 = -1;
const EXCEPTION_CONTINUE_SEARCH: i32 = 0;

fn capture(context: &CONTEXT) -> X64Context {
    X64Context {
        gprs: [
            context.Rax,
            context.Rcx,
            context.Rdx,
            context.Rbx,
            context.Rsp,
            context.Rbp,
            context.Rsi,
            context.Rdi,
            context.R8,
            context.R9,
            context.R10,
            context.R11,
            context.R12,
            context.R13,
            context.R14,
            context.R15,
        ],
        rip: context.Rip,
        rflags: context.EFlags as u64,
    }
}

fn restore(x64: &X64Context, context: &mut CONTEXT) {
    let [rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8, r9, r10, r11, r12, r13, r14, r15] = x64.gprs;
    context.Rax = rax;
    context.Rcx = rcx;
    context.Rdx = rdx;
    context.Rbx = rbx;
    context.Rsp = rsp;
    context.Rbp = rbp;
    context.Rsi = rsi;
    context.Rdi = rdi;
    context.R8 = r8;
    context.R9 = r9;
    context.R10 = r10;
    context.R11 = r11;
    context.R12 = r12;
    context.R13 = r13;
    context.R14 = r14;
    context.R15 = r15;
    context.Rip = x64.rip;
    context.EFlags = x64.rflags as u32;
}

unsafe extern "system" fn on_exception(pointers: *mut EXCEPTION_POINTERS) -> i32 {
    let pointers = &*pointers;
    if (*pointers.ExceptionRecord).ExceptionCode != EXCEPTION_ILLEGAL_INSTRUCTION {
        return EXCEPTION_CONTINUE_SEARCH;
    }

    let context = &mut *pointers.ContextRecord;
    let mut x64 = capture(context);
    if handle_illegal_instruction(&mut x64) {
        restore(&x64, context);
        EXCEPTION_CONTINUE_EXECUTION
    } else {
        EXCEPTION_CONTINUE_SEARCH
    }
}

pub fn install() -> Result<(), KernelError> {
    // Safety: the handler stays valid for the life of the process.
    let handle = unsafe { AddVectoredExceptionHandler(1, Some(on_exception)) };
    if handle.is_null() {
        return Err(KernelError::ExceptionHook("AddVectoredExceptionHandler failed".to_string()));
    }
    tracing::debug!("Vectored exception handler installed");
    Ok(())
}
