//! Infrastructure configuration - where things live and how loudly we log.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Filesystem paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// One JSON file per finished session.
    /// Default: ~/.local/share/reel/sessions
    #[serde(default = "PathsConfig::default_metadata_dir")]
    pub metadata_dir: PathBuf,
}

impl PathsConfig {
    fn default_metadata_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".local/share/reel/sessions"))
            .unwrap_or_else(|| PathBuf::from(".local/share/reel/sessions"))
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            metadata_dir: Self::default_metadata_dir(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// An `EnvFilter` directive, e.g. `info` or `reel=debug,turnstile=trace`.
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}
