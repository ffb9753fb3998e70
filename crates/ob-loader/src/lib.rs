//! Orbis ELF loader for oxidized-orbis
//!
//! Parses Orbis images, maps them into the host process, rewrites the
//! instructions the host cannot execute as-is and applies relocations
//! against the other loaded modules.

pub mod codegen;
pub mod dynamic;
pub mod eh_frame;
pub mod elf;
pub mod module;
pub mod patcher;
pub mod pattern;
pub mod program;
pub mod relocate;
pub mod rip_zone;
pub mod symbol;
pub mod text;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

// Re-export main types
pub use codegen::{entry_trampoline, FsBaseMode};
pub use dynamic::{DynamicInfo, LibraryInfo, ModuleInfo};
pub use eh_frame::EhFrameInfo;
pub use elf::ElfFile;
pub use module::{LoadOptions, Module, Region, SymbolResolver};
pub use patcher::PatchStats;
pub use program::ProgramInfo;
pub use rip_zone::RipPointers;
pub use symbol::{elf_hash, encode_symbol_name, parse_symbol_name};
