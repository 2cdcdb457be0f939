//! Detector configuration
//!
//! Read either from a TOML file or from the host's `server.cfg`, whose lines
//! are `key value` pairs shared with every other plugin. Keys this crate does
//! not know are ignored in `server.cfg` so the host's own settings pass
//! through untouched.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::trampoline::DEFAULT_MAX_HOPS;

/// Default bound on printed frames
pub const DEFAULT_MAX_TRACE_DEPTH: usize = 100;

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),

    /// A value has the wrong shape or is out of range
    #[error("Invalid value for `{key}`: {value}")]
    InvalidValue {
        /// Setting name
        key: String,
        /// Offending value
        value: String,
    },
}

/// Detector settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Terminate the process after reporting a runtime error
    pub die_on_error: bool,
    /// Maximum frames printed per trace
    pub max_trace_depth: usize,
    /// Maximum chained jump stubs followed when resolving a native address
    pub max_trampoline_hops: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            die_on_error: false,
            max_trace_depth: DEFAULT_MAX_TRACE_DEPTH,
            max_trampoline_hops: DEFAULT_MAX_HOPS,
        }
    }
}

impl Config {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse `server.cfg` style `key value` lines
    pub fn from_server_cfg_str(content: &str) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
                continue;
            }
            let (key, value) = match line.split_once(char::is_whitespace) {
                Some((key, value)) => (key, value.trim()),
                None => (line, ""),
            };
            match key {
                "die_on_error" => config.die_on_error = parse_bool(key, value)?,
                "max_trace_depth" => config.max_trace_depth = parse_usize(key, value)?,
                "max_trampoline_hops" => config.max_trampoline_hops = parse_usize(key, value)?,
                _ => {}
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`: `.toml` files as TOML, anything else as `server.cfg`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_str(&content),
            _ => Self::from_server_cfg_str(&content),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_trace_depth == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_trace_depth".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse().map_err(|_| invalid(key, value))
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}
