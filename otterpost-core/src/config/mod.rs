//! Configuration management
//!
//! Defaults, TOML files and `OTTERPOST_<SECTION>_<KEY>` environment
//! overrides. Every loader validates before returning.

use crate::logging::LogLevel;
use humantime_serde::re::humantime;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

mod error;

pub use error::ConfigError;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "OTTERPOST";

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub session: SessionConfig,
    pub reputation: ReputationConfig,
    pub storage: StorageConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub json_format: bool,
    pub with_target: bool,
}

/// Session loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Capacity of the command channel into the session loop
    pub command_buffer: usize,

    /// Capacity of the change-notification broadcast
    pub event_buffer: usize,

    /// Consecutive messages closer than this merge into one visual group
    #[serde(with = "humantime_serde")]
    pub group_gap: Duration,
}

/// Reputation API configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationConfig {
    /// Base URL of the reputation API
    pub base_url: String,

    /// How long a fetched profile stays fresh
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Minimum spacing between expiry sweeps
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

/// Local persistence configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the key/value file
    pub data_dir: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: LogLevel::Info, json_format: false, with_target: true }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_buffer: 64,
            event_buffer: 256,
            group_gap: Duration::from_secs(5 * 60),
        }
    }
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8787/api".to_string(),
            ttl: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { data_dir: PathBuf::from("./data") }
    }
}

impl StorageConfig {
    /// Path of the key/value file inside `data_dir`
    pub fn kv_path(&self) -> PathBuf {
        self.data_dir.join("otterpost-kv.json")
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn parse_duration(key: &str, raw: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(raw.trim()).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

impl Config {
    /// Load configuration from the process environment
    ///
    /// Variables follow `OTTERPOST_<SECTION>_<KEY>`, for example
    /// `OTTERPOST_REPUTATION_TTL=10m`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `OTTERPOST_*` overrides from an arbitrary lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |section: &str, key: &str| {
            let name = format!("{}_{}_{}", ENV_PREFIX, section, key);
            lookup(&name).map(|value| (name, value))
        };

        // Logging
        if let Some((name, v)) = var("LOGGING", "LEVEL") {
            self.logging.level = parse_value(&name, &v)?;
        }
        if let Some((name, v)) = var("LOGGING", "JSON_FORMAT") {
            self.logging.json_format = parse_value(&name, &v)?;
        }
        if let Some((name, v)) = var("LOGGING", "WITH_TARGET") {
            self.logging.with_target = parse_value(&name, &v)?;
        }

        // Session
        if let Some((name, v)) = var("SESSION", "COMMAND_BUFFER") {
            self.session.command_buffer = parse_value(&name, &v)?;
        }
        if let Some((name, v)) = var("SESSION", "EVENT_BUFFER") {
            self.session.event_buffer = parse_value(&name, &v)?;
        }
        if let Some((name, v)) = var("SESSION", "GROUP_GAP") {
            self.session.group_gap = parse_duration(&name, &v)?;
        }

        // Reputation
        if let Some((_, v)) = var("REPUTATION", "BASE_URL") {
            self.reputation.base_url = v.trim().to_string();
        }
        if let Some((name, v)) = var("REPUTATION", "TTL") {
            self.reputation.ttl = parse_duration(&name, &v)?;
        }
        if let Some((name, v)) = var("REPUTATION", "SWEEP_INTERVAL") {
            self.reputation.sweep_interval = parse_duration(&name, &v)?;
        }
        if let Some((name, v)) = var("REPUTATION", "REQUEST_TIMEOUT") {
            self.reputation.request_timeout = parse_duration(&name, &v)?;
        }

        // Storage
        if let Some((_, v)) = var("STORAGE", "DATA_DIR") {
            self.storage.data_dir = PathBuf::from(v);
        }

        Ok(())
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.command_buffer == 0 {
            return Err(ConfigError::ValidationFailed(
                "session.command_buffer must be greater than 0".to_string(),
            ));
        }
        if self.session.event_buffer == 0 {
            return Err(ConfigError::ValidationFailed(
                "session.event_buffer must be greater than 0".to_string(),
            ));
        }
        if self.session.group_gap.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "session.group_gap must be non-zero".to_string(),
            ));
        }

        let url = &self.reputation.base_url;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::ValidationFailed(format!(
                "reputation.base_url must be an http(s) URL: {}",
                url
            )));
        }
        if self.reputation.ttl.is_zero() || self.reputation.sweep_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "reputation.ttl and reputation.sweep_interval must be non-zero".to_string(),
            ));
        }

        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let contents = self.to_toml()?;
        std::fs::write(path, contents).map_err(|e| ConfigError::FileWriteError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.reputation.ttl, Duration::from_secs(300));
        assert_eq!(config.session.group_gap, Duration::from_secs(300));
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.session.command_buffer = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.reputation.base_url = "ftp://example".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.reputation.ttl = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("OTTERPOST_LOGGING_LEVEL", "DEBUG"),
            ("OTTERPOST_REPUTATION_TTL", "10m"),
            ("OTTERPOST_SESSION_EVENT_BUFFER", "32"),
            ("OTTERPOST_STORAGE_DATA_DIR", "/tmp/otter"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.reputation.ttl, Duration::from_secs(600));
        assert_eq!(config.session.event_buffer, 32);
        assert_eq!(config.storage.data_dir, PathBuf::from("/tmp/otter"));
    }

    #[test]
    fn test_invalid_override_names_the_key() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(|key| (key == "OTTERPOST_SESSION_GROUP_GAP").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("OTTERPOST_SESSION_GROUP_GAP"));
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("otterpost.toml");

        let mut config = Config::default();
        config.reputation.ttl = Duration::from_secs(90);
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "[logging]\nlevel = \"warn\"\n").unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.logging.level, LogLevel::Warn);
        assert_eq!(loaded.session, SessionConfig::default());
    }
}
