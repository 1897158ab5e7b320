//! Configuration management for aie-partition.
//!
//! Configuration is loaded from multiple sources in priority order:
//! 1. Environment variables (AIE_GENERATION, AIE_COLUMNS, ...)
//! 2. Project-local config file (`./aie-partition.toml`)
//! 3. User config file (`~/.config/aie-partition/config.toml`)
//! 4. Built-in defaults
//!
//! # Config File Format
//!
//! ```toml
//! # aie-partition.toml
//!
//! [device]
//! generation = "aieml"
//! start_col = 0
//! columns = 38
//! rows = 11
//!
//! [runtime]
//! poll_retries = 1000
//! queue_depth = 1
//! reset_on_release = false
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::aperture::ApertureSettings;
use crate::device::{DeviceGeneration, Range};

/// Global cached configuration.
static CONFIG: OnceLock<Config> = OnceLock::new();

/// Aperture geometry and generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub generation: DeviceGeneration,
    /// First column of the aperture.
    pub start_col: u32,
    pub columns: u32,
    /// Rows per column, shim row included.
    pub rows: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            generation: DeviceGeneration::Aie,
            start_col: 0,
            columns: 50,
            rows: 9,
        }
    }
}

/// Timing and policy knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Reads before a hardware poll gives up.
    pub poll_retries: u32,
    /// Capacity of each aperture's deferred-work queue.
    pub queue_depth: usize,
    /// Reset a partition's columns on every release.
    pub reset_on_release: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_retries: 1000,
            queue_depth: 1,
            reset_on_release: false,
        }
    }
}

/// Config file sections as written; absent keys stay `None` so that a
/// later file only overrides what it names.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    device: DeviceFile,
    runtime: RuntimeFile,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct DeviceFile {
    generation: Option<DeviceGeneration>,
    start_col: Option<u32>,
    columns: Option<u32>,
    rows: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RuntimeFile {
    poll_retries: Option<u32>,
    queue_depth: Option<usize>,
    reset_on_release: Option<bool>,
}

/// aie-partition configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub runtime: RuntimeConfig,
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Project-local `aie-partition.toml`
    /// 3. User config `~/.config/aie-partition/config.toml`
    /// 4. Defaults
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(user_config) = Self::load_user_config() {
            config.merge(user_config);
        }

        if let Some(local_config) = Self::load_local_config() {
            config.merge(local_config);
        }

        config.apply_env_overrides(|key| std::env::var(key).ok());

        config
    }

    /// Get the cached global configuration.
    ///
    /// Loads configuration on first call and caches it.
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(|| {
            let config = Self::load();
            log::debug!("Loaded configuration: {:?}", config);
            config
        })
    }

    /// Aperture range described by the `[device]` section.
    pub fn aperture_range(&self) -> Range {
        Range::new(self.device.start_col, 0, self.device.columns, self.device.rows)
    }

    pub fn aperture_settings(&self) -> ApertureSettings {
        ApertureSettings {
            queue_depth: self.runtime.queue_depth,
            reset_on_release: self.runtime.reset_on_release,
        }
    }

    /// Load user configuration from ~/.config/aie-partition/config.toml
    fn load_user_config() -> Option<ConfigFile> {
        let path = Self::user_config_path()?;
        Self::load_from_file(&path)
    }

    /// Load project-local configuration from ./aie-partition.toml
    fn load_local_config() -> Option<ConfigFile> {
        let local_path = Path::new("aie-partition.toml");
        if let Some(config) = Self::load_from_file(local_path) {
            return Some(config);
        }

        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            let project_path = Path::new(&manifest_dir).join("aie-partition.toml");
            if let Some(config) = Self::load_from_file(&project_path) {
                return Some(config);
            }
        }

        None
    }

    fn load_from_file(path: &Path) -> Option<ConfigFile> {
        if !path.exists() {
            return None;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    Some(config)
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to read {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Merge a config file into this one.
    /// Only overrides fields the file sets.
    fn merge(&mut self, other: ConfigFile) {
        let device = other.device;
        if let Some(generation) = device.generation {
            self.device.generation = generation;
        }
        if let Some(start_col) = device.start_col {
            self.device.start_col = start_col;
        }
        if let Some(columns) = device.columns {
            self.device.columns = columns;
        }
        if let Some(rows) = device.rows {
            self.device.rows = rows;
        }

        let runtime = other.runtime;
        if let Some(retries) = runtime.poll_retries {
            self.runtime.poll_retries = retries;
        }
        if let Some(depth) = runtime.queue_depth {
            self.runtime.queue_depth = depth;
        }
        if let Some(reset) = runtime.reset_on_release {
            self.runtime.reset_on_release = reset;
        }
    }

    /// Apply environment variable overrides read through `var`.
    fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(value) = var("AIE_GENERATION") {
            match value.parse() {
                Ok(generation) => {
                    log::info!("Using AIE_GENERATION from environment: {}", value);
                    self.device.generation = generation;
                }
                Err(e) => log::warn!("Ignoring AIE_GENERATION={}: {}", value, e),
            }
        }
        override_u32(&var, "AIE_COLUMNS", &mut self.device.columns);
        override_u32(&var, "AIE_ROWS", &mut self.device.rows);
        override_u32(&var, "AIE_POLL_RETRIES", &mut self.runtime.poll_retries);
    }

    /// Get the path to the user config file (for display/creation).
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("aie-partition").join("config.toml"))
    }

    /// Generate a sample config file content.
    pub fn sample_config() -> String {
        r#"# aie-partition configuration
# Place this file at ~/.config/aie-partition/config.toml or ./aie-partition.toml

[device]
# Silicon generation: "aie" or "aieml"
generation = "aie"

# Aperture geometry; rows include the shim row
start_col = 0
columns = 50
rows = 9

[runtime]
# Register reads before a hardware poll times out
poll_retries = 1000

# Deferred error-backtrack queue depth per aperture
# queue_depth = 1

# Reset partition columns whenever a partition is released
# reset_on_release = false
"#
        .to_string()
    }
}

fn override_u32(var: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut u32) {
    let Some(value) = var(key) else { return };
    match value.parse() {
        Ok(parsed) => {
            log::info!("Using {} from environment: {}", key, value);
            *slot = parsed;
        }
        Err(e) => log::warn!("Ignoring {}={}: {}", key, value, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.device.generation, DeviceGeneration::Aie);
        assert_eq!(config.aperture_range(), Range::new(0, 0, 50, 9));
        assert_eq!(config.aperture_settings(), ApertureSettings::default());
    }

    #[test]
    fn test_config_merge() {
        let mut base = Config::default();
        let overlay: ConfigFile = toml::from_str(
            r#"
            [device]
            generation = "aieml"
            columns = 38

            [runtime]
            reset_on_release = true
            "#,
        )
        .unwrap();

        base.merge(overlay);

        assert_eq!(base.device.generation, DeviceGeneration::AieMl);
        assert_eq!(base.device.columns, 38);
        // Untouched keys keep their previous values
        assert_eq!(base.device.rows, 9);
        assert_eq!(base.runtime.poll_retries, 1000);
        assert!(base.runtime.reset_on_release);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("AIE_GENERATION", "aie-ml"),
            ("AIE_ROWS", "11"),
            ("AIE_POLL_RETRIES", "lots"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.device.generation, DeviceGeneration::AieMl);
        assert_eq!(config.device.rows, 11);
        // Unparseable values are ignored
        assert_eq!(config.runtime.poll_retries, 1000);
    }

    #[test]
    fn test_sample_config_parses() {
        let sample = Config::sample_config();
        let parsed: Config = toml::from_str(&sample).expect("Sample config should parse");
        assert_eq!(parsed, Config::default());
    }
}
