//! Orbis kernel emulation (HLE) for oxidized-orbis
//!
//! Hosts loaded modules in the current process: the object table behind
//! guest handles, the FreeBSD-style syscall surface, the process runtime
//! that loads, links and starts the boot module, and the exception hook
//! that emulates BMI1 on hosts without it.

pub mod exception;
pub mod guest;
pub mod memory;
pub mod object_table;
pub mod objects;
pub mod runtime;
pub mod startup;
pub mod sync;
pub mod syscall;
pub mod syscall_numbers;
pub mod syscalls;

pub use object_table::{Handle, ObjectTable};
pub use objects::{Object, ObjectKind, ObjectOps, ObjectType};
pub use runtime::Runtime;
pub use syscall::{SyscallError, SyscallResult, SyscallTable};
