//! Configuration loading for reel.
//!
//! Every value has a compiled default, so running with no config files at all is
//! fine. Files and environment variables only override what they mention.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/reel/config.toml` (system)
//! 2. `~/.config/reel/config.toml` (user)
//! 3. `./reel.toml` (local override), or the path given with `--config`
//! 4. Environment variables (`REEL_*`, `RUST_LOG`)
//!
//! # Example Config
//!
//! ```toml
//! [lock]
//! default_timeout_ms = 30000
//!
//! [session]
//! max_duration_secs = 3600      # 0 = unlimited
//! start_timeout_ms = 10000
//! stop_timeout_ms = 15000
//!
//! [retry]
//! max_retries = 2
//! strategy = "exponential"      # or "linear"
//! base_ms = 200
//! max_ms = 5000
//!
//! [paths]
//! metadata_dir = "~/.local/share/reel/sessions"
//!
//! [telemetry]
//! log_level = "info"
//! ```

pub mod infra;
pub mod limits;
pub mod loader;

pub use infra::{PathsConfig, TelemetryConfig};
pub use limits::{LockConfig, RetryConfig, RetryStrategy, SessionConfig};
pub use loader::{discover_config_files_with_override, ConfigSources};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid value in environment variable {var}: {message}")]
    Env { var: String, message: String },

    #[error("Invalid configuration: {field} {message}")]
    Invalid { field: String, message: String },
}

impl ConfigError {
    fn invalid(field: &str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Complete reel configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ReelConfig {
    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl ReelConfig {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration with `config_path` in place of `./reel.toml`.
    ///
    /// System and user configs still load first.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and return information about sources.
    pub fn load_with_sources() -> Result<(Self, ConfigSources), ConfigError> {
        Self::load_with_sources_from(None)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = ReelConfig::default();

        for path in loader::discover_config_files_with_override(config_path) {
            loader::apply_file(&mut config, &path)?;
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut config, &mut sources)?;

        Ok((config, sources))
    }

    /// Check cross-field constraints. Called once when a controller is built.
    ///
    /// A lock hold must be able to cover the longest single critical section,
    /// otherwise the watchdog would force-release healthy operations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;

        for (field, value) in [
            ("lock.default_timeout_ms", self.lock.default_timeout_ms),
            ("session.start_timeout_ms", session.start_timeout_ms),
            ("session.stop_timeout_ms", session.stop_timeout_ms),
            ("session.control_timeout_ms", session.control_timeout_ms),
            ("session.persist_timeout_ms", session.persist_timeout_ms),
            ("session.shutdown_timeout_ms", session.shutdown_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be greater than zero"));
            }
        }

        let stop_budget = session
            .stop_timeout_ms
            .saturating_add(session.persist_timeout_ms);
        let longest_section = session
            .start_timeout_ms
            .max(session.control_timeout_ms)
            .max(stop_budget);
        if self.lock.default_timeout_ms < longest_section {
            return Err(ConfigError::invalid(
                "lock.default_timeout_ms",
                format!(
                    "({}) must cover the longest session operation ({}ms)",
                    self.lock.default_timeout_ms, longest_section
                ),
            ));
        }

        if session.shutdown_timeout_ms < stop_budget {
            return Err(ConfigError::invalid(
                "session.shutdown_timeout_ms",
                format!(
                    "({}) must cover stop plus persist ({}ms)",
                    session.shutdown_timeout_ms, stop_budget
                ),
            ));
        }

        if self.retry.max_ms < self.retry.base_ms {
            return Err(ConfigError::invalid(
                "retry.max_ms",
                format!(
                    "({}) must not be below retry.base_ms ({})",
                    self.retry.max_ms, self.retry.base_ms
                ),
            ));
        }

        if self.telemetry.log_level.trim().is_empty() {
            return Err(ConfigError::invalid("telemetry.log_level", "must not be empty"));
        }

        Ok(())
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> String {
        // Built by hand to keep section order and comments stable.
        let mut output = String::new();

        output.push_str("# reel configuration\n\n");

        output.push_str("[lock]\n");
        output.push_str(&format!(
            "default_timeout_ms = {}\n",
            self.lock.default_timeout_ms
        ));

        output.push_str("\n[session]\n");
        output.push_str(&format!(
            "max_duration_secs = {}{}\n",
            self.session.max_duration_secs,
            if self.session.max_duration_secs == 0 {
                "  # unlimited"
            } else {
                ""
            }
        ));
        output.push_str(&format!(
            "start_timeout_ms = {}\n",
            self.session.start_timeout_ms
        ));
        output.push_str(&format!("stop_timeout_ms = {}\n", self.session.stop_timeout_ms));
        output.push_str(&format!(
            "control_timeout_ms = {}\n",
            self.session.control_timeout_ms
        ));
        output.push_str(&format!(
            "persist_timeout_ms = {}\n",
            self.session.persist_timeout_ms
        ));
        output.push_str(&format!(
            "shutdown_timeout_ms = {}\n",
            self.session.shutdown_timeout_ms
        ));

        output.push_str("\n[retry]\n");
        output.push_str(&format!("max_retries = {}\n", self.retry.max_retries));
        output.push_str(&format!("strategy = \"{}\"\n", self.retry.strategy));
        output.push_str(&format!("base_ms = {}\n", self.retry.base_ms));
        output.push_str(&format!("increment_ms = {}\n", self.retry.increment_ms));
        output.push_str(&format!("max_ms = {}\n", self.retry.max_ms));

        output.push_str("\n[paths]\n");
        output.push_str(&format!(
            "metadata_dir = \"{}\"\n",
            self.paths.metadata_dir.display()
        ));

        output.push_str("\n[telemetry]\n");
        output.push_str(&format!("log_level = \"{}\"\n", self.telemetry.log_level));

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ReelConfig::default();
        assert_eq!(config.lock.default_timeout_ms, 30_000);
        assert_eq!(config.session.max_duration_secs, 3600);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.telemetry.log_level, "info");
        assert!(config.paths.metadata_dir.ends_with("reel/sessions"));
        config.validate().unwrap();
    }

    #[test]
    fn test_to_toml_round_trips_through_loader() {
        let mut config = ReelConfig::default();
        config.retry.strategy = RetryStrategy::Linear;
        config.session.max_duration_secs = 0;

        let rendered = config.to_toml();
        assert!(rendered.contains("[lock]"));
        assert!(rendered.contains("# unlimited"));

        let mut reloaded = ReelConfig::default();
        loader::apply_toml(&mut reloaded, &rendered, Path::new("rendered.toml")).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_lock_must_cover_stop_and_persist() {
        let mut config = ReelConfig::default();
        config.lock.default_timeout_ms = 16_000;

        match config.validate().unwrap_err() {
            ConfigError::Invalid { field, .. } => assert_eq!(field, "lock.default_timeout_ms"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = ReelConfig::default();
        config.session.control_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_cap_below_base_rejected() {
        let mut config = ReelConfig::default();
        config.retry.base_ms = 1000;
        config.retry.max_ms = 10;
        assert!(config.validate().is_err());
    }
}
