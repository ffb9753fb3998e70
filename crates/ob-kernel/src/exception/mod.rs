//! Host exception hook
//!
//! Guest code compiled for the console may use BMI1. On hosts without it
//! those instructions raise an illegal-instruction fault, which is caught
//! here and emulated in software. `int n` sites patched to `ud2` fault the
//! same way but are left to the host.

pub mod bmi1;
pub mod context;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod unix;
#[cfg(all(windows, target_arch = "x86_64"))]
mod windows;

pub use context::X64Context;

use crate::objects::Object;
use crate::runtime::Runtime;
use ob_core::error::KernelError;
use ob_loader::Module;
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

const UD2: [u8; 2] = [0x0F, 0x0B];
const MAX_INSTRUCTION_LENGTH: usize = 15;
const HOST_PAGE_SIZE: u64 = 0x1000;

static EMULATE_BMI1: AtomicBool = AtomicBool::new(false);
static INSTALLED: OnceCell<()> = OnceCell::new();

pub fn set_bmi1_emulation(enabled: bool) {
    EMULATE_BMI1.store(enabled, Ordering::Release);
}

pub fn bmi1_emulation() -> bool {
    EMULATE_BMI1.load(Ordering::Acquire)
}

/// Hook illegal-instruction faults for the whole process. Installing twice
/// only updates the emulation switch.
pub fn install(emulate_bmi1: bool) -> Result<(), KernelError> {
    set_bmi1_emulation(emulate_bmi1);
    INSTALLED.get_or_try_init(install_host_hook)?;
    Ok(())
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn install_host_hook() -> Result<(), KernelError> {
    unix::install()
}

#[cfg(all(windows, target_arch = "x86_64"))]
fn install_host_hook() -> Result<(), KernelError> {
    windows::install()
}

#[cfg(not(any(
    all(target_os = "linux", target_arch = "x86_64"),
    all(windows, target_arch = "x86_64")
)))]
fn install_host_hook() -> Result<(), KernelError> {
    Err(KernelError::ExceptionHook("no exception hook for this host".to_string()))
}

/// Loaded module whose image covers `address`.
fn containing_module(address: u64) -> Option<Arc<Object>> {
    let runtime = Runtime::get()?;
    runtime
        .modules()
        .into_iter()
        .find(|o| o.as_module().is_some_and(|m| m.contains(address)))
}

/// Bytes that can be read at `address` without leaving the module text,
/// or the host page when the text bounds are unknown.
fn readable_code_length(address: u64, text_end: Option<u64>) -> usize {
    let end = text_end.unwrap_or((address | (HOST_PAGE_SIZE - 1)).wrapping_add(1));
    (end.saturating_sub(address) as usize).min(MAX_INSTRUCTION_LENGTH)
}

/// Handle an illegal-instruction fault. Returns whether `context` was
/// updated and execution can resume.
///
/// # Safety
///
/// `context.rip` must point at the faulting instruction.
pub unsafe fn handle_illegal_instruction(context: &mut X64Context) -> bool {
    let rip = context.rip;
    let module = containing_module(rip);
    let module = module.as_deref().and_then(Object::as_module);
    let text_end = module.map(Module::text).filter(|t| t.contains(rip)).map(|t| t.end());

    let code = std::slice::from_raw_parts(rip as *const u8, readable_code_length(rip, text_end));
    if code.starts_with(&UD2) {
        match module.and_then(|m| m.interrupts().get(&rip)) {
            Some(vector) => debug!("int 0x{:x} at 0x{:x} is not delivered", vector, rip),
            None => debug!("ud2 at 0x{:x}", rip),
        }
        return false;
    }

    if !bmi1_emulation() {
        return false;
    }

    match bmi1::emulate(context, code) {
        Ok(mnemonic) => {
            trace!("Emulated {:?} at 0x{:x}", mnemonic, rip);
            true
        }
        Err(e) => {
            debug!("Illegal instruction at 0x{:x}: {}", rip, e);
            false
        }
    }
}
