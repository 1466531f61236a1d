//! Configuration System
//!
//! Hierarchical configuration loading from:
//! - quereus.toml (default configuration)
//! - quereus.local.toml (git-ignored local overrides)
//! - Environment variables (QUEREUS_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # quereus.toml
//! [engine]
//! default_module = "memory"
//! statement_timeout_ms = 30000
//!
//! [logging]
//! level = "info"
//! format = "text"
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! QUEREUS_ENGINE__DEFAULT_MODULE=memory
//! QUEREUS_LOGGING__LEVEL=debug
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub shell: ShellConfig,
}

/// Engine defaults applied to every new database handle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Module used by CREATE TABLE without a USING clause
    #[serde(default = "default_module")]
    pub default_module: String,

    /// Statement timeout in milliseconds (0 = no timeout)
    #[serde(default)]
    pub statement_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Interactive shell configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    /// Readline history file; `None` disables history
    #[serde(default = "default_history_file")]
    pub history_file: Option<PathBuf>,
}

fn default_module() -> String {
    "memory".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}
fn default_history_file() -> Option<PathBuf> {
    Some(PathBuf::from(".quereus_history"))
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Merges in order:
    /// 1. quereus.toml (base configuration)
    /// 2. quereus.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (QUEREUS_* prefix)
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("quereus.toml"))
            .merge(Toml::file("quereus.local.toml"))
            .merge(Env::prefixed("QUEREUS_").split("__"))
            .extract()
    }

    /// Load configuration from a specific file path
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("QUEREUS_").split("__"))
            .extract()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            default_module: default_module(),
            statement_timeout_ms: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        ShellConfig {
            history_file: default_history_file(),
        }
    }
}
