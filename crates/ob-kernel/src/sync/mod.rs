//! Synchronization objects
//!
//! In-memory primitives created by the `evf_*`, `osem_*`, `kqueue` and
//! `eport_create` syscalls.

pub mod eport;
pub mod event_flag;
pub mod queue;
pub mod semaphore;

pub use eport::Eport;
pub use event_flag::EventFlag;
pub use queue::Queue;
pub use semaphore::Semaphore;
