//! Bridge configuration model.
//!
//! One `BridgeConfig` describes a bridge context: memory monitor tunables,
//! extension search paths and registry sizing. Every field has a default,
//! so an empty file (or no file) yields a working configuration.

use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields, default)]
pub struct BridgeConfig {
    /// Memory monitor settings.
    pub monitor: MonitorConfig,

    /// Extension module loading settings.
    pub loader: LoaderConfig,

    /// Handle registry settings.
    pub registry: RegistryConfig,
}

/// Memory monitor tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct MonitorConfig {
    /// Whether the background monitor task runs at all.
    pub enabled: bool,

    /// How often the monitor samples native allocation pressure.
    pub poll_interval_ms: u64,

    /// No collection is requested below this many native bytes.
    pub floor_bytes: u64,

    /// Fractional growth over the last baseline that triggers a
    /// collection request (0.3 = 30% growth).
    pub growth_threshold: f64,
}

impl Default for MonitorConfig {
    fn default() -> MonitorConfig {
        MonitorConfig {
            enabled: true,
            poll_interval_ms: 100,
            floor_bytes: 16 * 1024 * 1024,
            growth_threshold: 0.3,
        }
    }
}

/// Extension module loading settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields, default)]
pub struct LoaderConfig {
    /// Directories searched before the platform defaults.
    pub search_paths: Vec<String>,
}

/// Handle registry settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct RegistryConfig {
    /// Initial handle table capacity.
    pub handle_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> RegistryConfig {
        RegistryConfig {
            handle_capacity: 1024,
        }
    }
}

impl BridgeConfig {
    /// Loads a configuration file and validates it.
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::IoError(e)
            }
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
            file: path.to_path_buf(),
            error: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validates field ranges.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.monitor.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "monitor.poll_interval_ms".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if !self.monitor.growth_threshold.is_finite() || self.monitor.growth_threshold <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "monitor.growth_threshold".to_string(),
                reason: format!(
                    "must be a positive fraction, got {}",
                    self.monitor.growth_threshold
                ),
            });
        }
        for path in &self.loader.search_paths {
            if path.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "loader.search_paths".to_string(),
                    reason: "empty path entry".to_string(),
                });
            }
        }
        Ok(())
    }
}
