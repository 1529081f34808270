//! Configuration resolution.
//!
//! Settings are resolved in three layers, later overriding earlier:
//! 1. Built-in defaults
//! 2. The user configuration file (`<config dir>/vesper/config.toml`)
//! 3. Environment variables (`VESPER_*`)

use crate::global::BridgeConfig;
use crate::{ConfigError, ConfigResult};
use std::env;
use std::path::{Path, PathBuf};

/// Resolves a [`BridgeConfig`] from file and environment.
#[derive(Debug, Default)]
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn new() -> Self {
        ConfigLoader
    }

    /// Loads the user configuration file if present, then applies
    /// environment overrides. A missing file is not an error.
    pub fn load(&self) -> ConfigResult<BridgeConfig> {
        let config = match Self::user_config_path() {
            Ok(path) if path.exists() => BridgeConfig::load_from_file(&path)?,
            _ => BridgeConfig::default(),
        };
        self.apply_env_overrides(config)
    }

    /// Loads a specific file, then applies environment overrides.
    pub fn load_from_file(&self, path: &Path) -> ConfigResult<BridgeConfig> {
        let config = BridgeConfig::load_from_file(path)?;
        self.apply_env_overrides(config)
    }

    /// Location of the user configuration file.
    pub fn user_config_path() -> ConfigResult<PathBuf> {
        let base = dirs::config_dir().ok_or(ConfigError::HomeNotFound)?;
        Ok(base.join("vesper").join("config.toml"))
    }

    /// Environment overrides, `VESPER_<SECTION>_<KEY>`.
    fn apply_env_overrides(&self, mut config: BridgeConfig) -> ConfigResult<BridgeConfig> {
        if let Ok(enabled) = env::var("VESPER_MONITOR_ENABLED") {
            config.monitor.enabled = parse_bool("VESPER_MONITOR_ENABLED", &enabled)?;
        }
        if let Ok(interval) = env::var("VESPER_MONITOR_POLL_INTERVAL_MS") {
            config.monitor.poll_interval_ms =
                parse_number("VESPER_MONITOR_POLL_INTERVAL_MS", &interval)?;
        }
        if let Ok(floor) = env::var("VESPER_MONITOR_FLOOR_BYTES") {
            config.monitor.floor_bytes = parse_number("VESPER_MONITOR_FLOOR_BYTES", &floor)?;
        }
        if let Ok(threshold) = env::var("VESPER_MONITOR_GROWTH_THRESHOLD") {
            config.monitor.growth_threshold =
                threshold
                    .parse::<f64>()
                    .map_err(|_| ConfigError::InvalidValue {
                        field: "VESPER_MONITOR_GROWTH_THRESHOLD".to_string(),
                        reason: format!("expected a number, got '{threshold}'"),
                    })?;
        }
        if let Ok(paths) = env::var("VESPER_EXT_PATH") {
            // Prepend, keeping file-configured paths as a fallback.
            let mut merged: Vec<String> = env::split_paths(&paths)
                .map(|p| p.to_string_lossy().into_owned())
                .filter(|p| !p.is_empty())
                .collect();
            merged.extend(config.loader.search_paths);
            config.loader.search_paths = merged;
        }
        config.validate()?;
        Ok(config)
    }
}

fn parse_bool(field: &str, raw: &str) -> ConfigResult<bool> {
    match raw {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            field: field.to_string(),
            reason: format!("expected 'true' or 'false', got '{other}'"),
        }),
    }
}

fn parse_number(field: &str, raw: &str) -> ConfigResult<u64> {
    raw.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        reason: format!("expected an integer, got '{raw}'"),
    })
}
