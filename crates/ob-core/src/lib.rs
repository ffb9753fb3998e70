//! Core types for the oxidized-orbis loader
//!
//! This crate provides the error taxonomy, the guest errno values,
//! configuration and the host CPU feature probe shared by every other crate.

pub mod config;
pub mod cpu;
pub mod errno;
pub mod error;

pub use config::Config;
pub use cpu::CpuFeatures;
pub use errno::Errno;
pub use error::{OrbisError, Result};
