//! Bridge configuration loaded from `shadowbridge.toml`
//!
//! Every section and field is optional; missing values fall back to the
//! defaults below.

use crate::logging::{self, LogConfig, LogOutput};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_FILE_NAME: &str = "shadowbridge.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub logging: LoggingSection,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub ffi: FfiConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default = "default_format")]
    pub format: String,

    /// Log to this file (rotated daily) instead of stderr
    #[serde(default)]
    pub file: Option<String>,

    #[serde(default = "default_false")]
    pub span_events: bool,

    #[serde(default)]
    pub filter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Pre-sized capacity of the handle tables
    #[serde(default = "default_capacity")]
    pub initial_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FfiConfig {
    /// Abort the process when native code over-releases a reference
    #[serde(default = "default_true")]
    pub abort_on_refcount_violation: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: default_format(),
            file: None,
            span_events: false,
            filter: None,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            initial_capacity: default_capacity(),
        }
    }
}

impl Default for FfiConfig {
    fn default() -> Self {
        Self {
            abort_on_refcount_violation: true,
        }
    }
}

fn default_true() -> bool { true }
fn default_false() -> bool { false }
fn default_capacity() -> usize { 1024 }
fn default_level() -> String { "warn".to_string() }
fn default_format() -> String { "compact".to_string() }

impl LoggingSection {
    /// Subscriber settings; unknown level or format names keep the defaults
    pub fn to_log_config(&self) -> LogConfig {
        let mut config = LogConfig::default();
        if let Some(level) = logging::parse_level(&self.level) {
            config.level = level;
        }
        if let Some(format) = logging::parse_format(&self.format) {
            config.format = format;
        }
        config.output = match &self.file {
            Some(path) => logging::file_output(path),
            None => LogOutput::Stderr,
        };
        config.span_events = self.span_events;
        config.filter = self.filter.clone();
        config
    }
}

impl BridgeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Nearest `shadowbridge.toml` in `start` or its parents, else defaults
    pub fn discover_from(start: &Path) -> Self {
        let mut current = Some(start.to_path_buf());
        while let Some(dir) = current {
            let candidate = dir.join(CONFIG_FILE_NAME);
            if candidate.exists() {
                match Self::load(&candidate) {
                    Ok(config) => return config,
                    Err(err) => {
                        logging::warn!(
                            event = "config",
                            path = %candidate.display(),
                            error = %err,
                            "ignoring unreadable config"
                        );
                    }
                }
            }
            current = dir.parent().map(Path::to_path_buf);
        }
        Self::default()
    }

    /// `discover_from` the current directory
    pub fn discover() -> Self {
        std::env::current_dir()
            .map(|dir| Self::discover_from(&dir))
            .unwrap_or_default()
    }
}
