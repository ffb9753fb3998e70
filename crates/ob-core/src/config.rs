//! Configuration system for oxidized-orbis

use crate::error::{OrbisError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub memory: MemoryConfig,
    pub cpu: CpuConfig,
    pub debug: DebugConfig,
}

/// Module search settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Subdirectory of the boot module's directory holding system modules
    pub system_dir: String,
    /// Modules loaded ahead of a dynamic boot module
    pub preload: Vec<String>,
}

/// Guest memory settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub user_stack_size: u64,
}

/// Host CPU handling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuConfig {
    /// Emulate BMI1 instructions on illegal-instruction traps
    pub emulate_bmi1: bool,
    /// Refuse to start when required extensions are missing
    pub require_features: bool,
    /// Keep the guest `fs` base in the host `gs` base (Linux only). When
    /// off, every module reads the fs base from one process-wide slot, so
    /// the last thread to set it wins for all threads.
    pub host_gs_fsbase: bool,
}

/// Debug settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub log_level: LogLevel,
    pub trace_syscalls: bool,
}

/// Logging level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            system_dir: "uplift_sys".to_string(),
            preload: vec![
                "libkernel.prx".to_string(),
                "libSceLibcInternal.prx".to_string(),
            ],
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            user_stack_size: 20 * 1024 * 1024,
        }
    }
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            emulate_bmi1: true,
            require_features: true,
            host_gs_fsbase: false,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            trace_syscalls: false,
        }
    }
}

impl Config {
    /// Load configuration from the default location, or create it with defaults
    pub fn load() -> Result<Self> {
        let path = Self::config_path();

        if path.exists() {
            Self::load_from(&path)
        } else {
            let config = Self::default();
            config.save_to(&path)?;
            tracing::info!("Wrote default configuration to {}", path.display());
            Ok(config)
        }
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| OrbisError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| OrbisError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the path to the configuration file
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("oxidized-orbis")
            .join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.system_dir, "uplift_sys");
        assert_eq!(config.general.preload.len(), 2);
        assert_eq!(config.memory.user_stack_size, 20 * 1024 * 1024);
        assert!(config.cpu.emulate_bmi1);
        assert!(!config.cpu.host_gs_fsbase);
        assert_eq!(config.debug.log_level.as_filter(), "info");
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.general.preload, config.general.preload);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: Config = toml::from_str("[debug]\nlog_level = \"Trace\"\n").unwrap();
        assert_eq!(parsed.debug.log_level, LogLevel::Trace);
        assert_eq!(parsed.general.system_dir, "uplift_sys");
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.debug.trace_syscalls = true;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert!(loaded.debug.trace_syscalls);
    }
}
