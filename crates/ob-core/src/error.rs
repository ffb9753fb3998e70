//! Error types for the oxidized-orbis loader

use thiserror::Error;

/// Main error type for the loader
#[derive(Error, Debug)]
pub enum OrbisError {
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Loader error: {0}")]
    Loader(#[from] LoaderError),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Patch error: {0}")]
    Patch(#[from] PatchError),

    #[error("Kernel error: {0}")]
    Kernel(#[from] KernelError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Missing CPU features: {0}")]
    MissingCpuFeatures(String),

    #[error("Unsupported feature: {0}")]
    Unsupported(String),
}

/// Host virtual-memory errors
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Out of memory")]
    OutOfMemory,

    #[error("Failed to reserve 0x{size:x} bytes")]
    ReserveFailed { size: u64 },

    #[error("Failed to commit 0x{size:x} bytes at 0x{addr:016x}")]
    CommitFailed { addr: u64, size: u64 },

    #[error("Failed to protect 0x{size:x} bytes at 0x{addr:016x}")]
    ProtectFailed { addr: u64, size: u64 },

    #[error("Range 0x{addr:016x}+0x{size:x} is outside the reservation")]
    OutOfRange { addr: u64, size: u64 },

    #[error("Alignment error: address 0x{addr:016x} not aligned to 0x{align:x}")]
    AlignmentError { addr: u64, align: u64 },
}

/// Image parsing and module placement errors
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("Invalid ELF: {0}")]
    InvalidElf(String),

    #[error("Invalid program header {index}: {reason}")]
    InvalidProgramHeader { index: usize, reason: String },

    #[error("Invalid dynamic info: {0}")]
    InvalidDynamic(String),

    #[error("Missing dynamic tag: {0}")]
    MissingDynamicTag(&'static str),

    #[error("No room for the RIP zone within reach of the text")]
    RipZonePlacement,

    #[error("Module not found: {0}")]
    MissingModule(String),
}

/// Symbol resolution and relocation errors
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Unsupported relocation type {0}")]
    UnsupportedRelocation(u32),

    #[error("Copy relocations are not supported")]
    CopyRelocation,

    #[error("Unsupported symbol binding {0}")]
    UnsupportedBinding(u8),

    #[error("Symbol index {0} out of range")]
    SymbolOutOfRange(u32),

    #[error("Malformed symbol name: {0}")]
    BadSymbolName(String),

    #[error("Unknown module id {0}")]
    UnknownModuleId(u16),

    #[error("Unknown library id {0}")]
    UnknownLibraryId(u16),

    #[error("Unresolved symbol: {0}")]
    UnresolvedSymbol(String),

    #[error("Relocation target 0x{0:016x} outside the module")]
    TargetOutOfRange(u64),
}

/// Text analysis and patching errors
#[derive(Error, Debug)]
pub enum PatchError {
    #[error("Could not locate the text region")]
    TextRegionNotFound,

    #[error("Unrecognized syscall site at 0x{0:016x}")]
    UnrecognizedSyscall(u64),

    #[error("Instruction at 0x{addr:016x} is {len} bytes, too short to patch")]
    SiteTooShort { addr: u64, len: usize },

    #[error("Unsupported interrupt at 0x{0:016x}")]
    UnsupportedInterrupt(u64),

    #[error("Unsupported fs: operand at 0x{0:016x}")]
    UnsupportedFsOperand(u64),

    #[error("Unsupported segment override at 0x{0:016x}")]
    UnsupportedSegment(u64),

    #[error("RIP zone exhausted")]
    RipZoneExhausted,

    #[error("Trampoline at 0x{0:016x} is out of rel32 reach")]
    OutOfReach(u64),
}

/// Runtime and kernel-layer errors
#[derive(Error, Debug)]
pub enum KernelError {
    #[error("Unknown syscall: {0}")]
    UnknownSyscall(u64),

    #[error("Runtime already initialized")]
    AlreadyInitialized,

    #[error("No boot module loaded")]
    NoBootModule,

    #[error("Required system module missing: {0}")]
    MissingSystemModule(String),

    #[error("Module ordering stalled on: {0}")]
    SortStalled(String),

    #[error("Object table error: {0}")]
    ObjectTable(crate::Errno),

    #[error("Exception hook installation failed: {0}")]
    ExceptionHook(String),

    #[error("Invalid startup frame: {0}")]
    StartupFrame(String),
}

/// Result type alias for loader operations
pub type Result<T> = std::result::Result<T, OrbisError>;
