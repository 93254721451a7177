//! Launcher settings file support.
//!
//! Settings precedence:
//! 1. CLI arguments (handled by clap)
//! 2. Local settings file (./.ignite.toml)
//! 3. Global settings file (~/.ignite/config.toml)
//! 4. Defaults

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LauncherSettings {
    /// Runtime program started for each job
    #[serde(default)]
    pub runtime: Option<String>,

    /// Log level used when `--log-level` is not given
    #[serde(default)]
    pub log_level: Option<String>,

    /// Master port draws before giving up
    #[serde(default)]
    pub port_attempts: Option<u32>,

    /// Device list used when a job does not name one
    #[serde(default)]
    pub devices: Option<Vec<u32>>,
}

impl LauncherSettings {
    /// Load settings from a TOML file. A missing file yields `None`.
    pub fn load_from_file(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        let settings = toml::from_str(&content)
            .with_context(|| format!("failed to parse settings file {}", path.display()))?;
        Ok(Some(settings))
    }

    pub fn default_global_path() -> PathBuf {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(".ignite")
            .join("config.toml")
    }

    pub fn default_local_path() -> PathBuf {
        PathBuf::from(".ignite.toml")
    }

    /// Load the global then the local settings file; local values win.
    pub fn discover_and_load() -> Result<Self> {
        Self::load_layers(&[Self::default_global_path(), Self::default_local_path()])
    }

    fn load_layers(paths: &[PathBuf]) -> Result<Self> {
        let mut settings = Self::default();
        for path in paths {
            if let Some(layer) = Self::load_from_file(path)? {
                settings.merge(layer);
            }
        }
        Ok(settings)
    }

    /// Values present in `other` replace ours.
    pub fn merge(&mut self, other: Self) {
        if other.runtime.is_some() {
            self.runtime = other.runtime;
        }
        if other.log_level.is_some() {
            self.log_level = other.log_level;
        }
        if other.port_attempts.is_some() {
            self.port_attempts = other.port_attempts;
        }
        if other.devices.is_some() {
            self.devices = other.devices;
        }
    }
}
