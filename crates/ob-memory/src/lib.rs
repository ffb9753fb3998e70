//! Host virtual memory for oxidized-orbis
//!
//! Guest images are mapped straight into the host process. This crate wraps
//! the host's reserve/commit/protect/release calls, the page protection
//! flags, and anonymous shared sections used for guest shared memory.

pub mod pages;
pub mod section;
pub mod vm;

pub use pages::{align_down, align_up, is_aligned, PageFlags, GUEST_PAGE_SIZE};
pub use section::SharedSection;
pub use vm::Reservation;
