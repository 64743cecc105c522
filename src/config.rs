//! Configuration loading
//!
//! Configuration comes from an optional TOML file layered over compiled
//! defaults, then environment overrides (`STRIDE_*`). Every section and field
//! has a default, so an empty file is a valid configuration.
//!
//! ```toml
//! [link]
//! request_timeout_ms = 5000
//!
//! [session]
//! snapshot_interval_ms = 1000
//! delegate_to_companion = true
//!
//! [aggregation]
//! query_timeout_ms = 10000
//! split_distance_m = 1000.0
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Env var overriding `logging.level`
pub const ENV_LOG: &str = "STRIDE_LOG";
/// Env var overriding `link.request_timeout_ms`
pub const ENV_REQUEST_TIMEOUT_MS: &str = "STRIDE_REQUEST_TIMEOUT_MS";

/// Complete Stride configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrideConfig {
    pub link: LinkConfig,
    pub session: SessionConfig,
    pub aggregation: AggregationConfig,
    pub logging: LoggingConfig,
}

/// Companion link settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Default reply timeout for requests
    pub request_timeout_ms: u64,
    /// How often the reactor sweeps abandoned request slots
    pub sweep_interval_ms: u64,
}

impl LinkConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
            sweep_interval_ms: 1_000,
        }
    }
}

/// Session controller settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Metrics broadcast cadence while active
    pub snapshot_interval_ms: u64,
    /// Hand local starts to the companion when it is reachable
    pub delegate_to_companion: bool,
    /// Completed workouts kept for `activities` replies
    pub recent_workouts: usize,
}

impl SessionConfig {
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms.max(1))
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_ms: 1_000,
            delegate_to_companion: true,
            recent_workouts: 10,
        }
    }
}

/// Finalize pipeline settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Upper bound for each finalize sub-query
    pub query_timeout_ms: u64,
    /// Distance between split boundaries
    pub split_distance_m: f64,
}

impl AggregationConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: 10_000,
            split_distance_m: 1_000.0,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. "info" or "synheart_stride=debug"
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl StrideConfig {
    /// Load configuration from an optional file, then apply env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Parse a TOML file without env overrides
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Apply `STRIDE_*` overrides using the given lookup
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup(ENV_LOG) {
            self.logging.level = level;
        }
        if let Some(raw) = lookup(ENV_REQUEST_TIMEOUT_MS) {
            self.link.request_timeout_ms =
                raw.trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidOverride {
                        key: ENV_REQUEST_TIMEOUT_MS,
                        value: raw.clone(),
                    })?;
        }
        Ok(())
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = StrideConfig::default();
        assert_eq!(config.link.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.aggregation.split_distance_m, 1000.0);
        assert!(config.session.delegate_to_companion);
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[session]\nsnapshot_interval_ms = 250\n\n[logging]\nformat = \"json\"").unwrap();

        let config = StrideConfig::from_file(file.path()).unwrap();
        assert_eq!(config.session.snapshot_interval(), Duration::from_millis(250));
        assert!(config.session.delegate_to_companion);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.link, LinkConfig::default());
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = StrideConfig::from_file(Path::new("/nonexistent/stride.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[link\nrequest_timeout_ms = ").unwrap();

        let err = StrideConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = StrideConfig::default();
        config
            .apply_env_overrides(|key| match key {
                ENV_LOG => Some("debug".to_string()),
                ENV_REQUEST_TIMEOUT_MS => Some("750".to_string()),
                _ => None,
            })
            .unwrap();

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.link.request_timeout_ms, 750);
    }

    #[test]
    fn test_invalid_env_override() {
        let mut config = StrideConfig::default();
        let err = config
            .apply_env_overrides(|key| (key == ENV_REQUEST_TIMEOUT_MS).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOverride { .. }));
    }

    #[test]
    fn test_to_toml_round_trips() {
        let config = StrideConfig::default();
        let parsed: StrideConfig = toml::from_str(&config.to_toml()).unwrap();
        assert_eq!(parsed, config);
    }
}
