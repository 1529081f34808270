//! Configuration for the extension bridge.
//!
//! Settings live in `<config dir>/vesper/config.toml` and may be
//! overridden per-process through `VESPER_*` environment variables:
//!
//! 1. Built-in defaults
//! 2. User configuration file
//! 3. Environment variables (`VESPER_*`)
//!
//! # Example
//!
//! ```no_run
//! use vesper_config::ConfigLoader;
//!
//! let config = ConfigLoader::new().load().unwrap();
//! assert!(config.monitor.poll_interval_ms > 0);
//! ```

pub mod global;
pub mod loader;

use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid TOML syntax in {file}: {error}")]
    TomlParseError {
        file: PathBuf,
        error: toml::de::Error,
    },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Home directory not found")]
    HomeNotFound,
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

// Re-export main types
pub use global::{BridgeConfig, LoaderConfig, MonitorConfig, RegistryConfig};
pub use loader::ConfigLoader;
