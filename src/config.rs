//! Registry configuration.
//!
//! Settings come from three layers, later ones winning:
//! built-in defaults under `~/.libreg`, an optional `~/.libreg/config.json`,
//! then `LIBREG_*` environment variables (a `.env` file is loaded first).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::registry::RegistryOptions;

pub const ENV_ETC_DIR: &str = "LIBREG_ETC_DIR";
pub const ENV_DATA_DIR: &str = "LIBREG_DATA_DIR";
pub const ENV_EXTENSION: &str = "LIBREG_EXTENSION";
pub const ENV_CHECK_ON_READ: &str = "LIBREG_CHECK_ON_READ";
pub const ENV_WATCH: &str = "LIBREG_WATCH";

/// Where the registry reads configuration files and keeps library data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Directory holding library configuration files.
    pub etc_dir: PathBuf,
    /// Data directory handed to library constructors.
    pub data_dir: PathBuf,
    /// Extension of configuration files.
    pub extension: String,
    /// Flush pending file changes before each lookup.
    pub check_on_read: bool,
    /// Use filesystem notifications in `libreg watch`; poll `etc_dir` when off.
    pub watch: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        let base = Self::dir();
        Self {
            etc_dir: base.join("etc"),
            data_dir: base.join("data"),
            extension: "json".to_string(),
            check_on_read: true,
            watch: true,
        }
    }
}

impl RegistryConfig {
    /// Base directory, `~/.libreg`.
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".libreg")
    }

    /// Path of the optional configuration file.
    pub fn path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Load from defaults, the configuration file and the environment.
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let config = Self::load_from_path(&Self::path())?;
        Ok(config.apply_env_overrides(|key| std::env::var(key).ok()))
    }

    /// Load a configuration file, falling back to defaults if it is missing.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No registry config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Apply `LIBREG_*` overrides read through `lookup`.
    pub fn apply_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_ETC_DIR).filter(|v| !v.trim().is_empty()) {
            self.etc_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup(ENV_DATA_DIR).filter(|v| !v.trim().is_empty()) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(ext) = lookup(ENV_EXTENSION).filter(|v| !v.trim().is_empty()) {
            self.extension = ext.trim().trim_start_matches('.').to_string();
        }
        if let Some(flag) = lookup(ENV_CHECK_ON_READ).and_then(|v| parse_bool(&v)) {
            self.check_on_read = flag;
        }
        if let Some(flag) = lookup(ENV_WATCH).and_then(|v| parse_bool(&v)) {
            self.watch = flag;
        }
        self
    }

    /// Registry options derived from this configuration.
    pub fn options(&self) -> RegistryOptions {
        RegistryOptions {
            extension: self.extension.clone(),
            check_on_read: self.check_on_read,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
