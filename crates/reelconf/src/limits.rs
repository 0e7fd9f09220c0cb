//! Timing limits - lock, session and retry budgets.
//!
//! Values are stored as plain integers so the TOML stays readable; the `Duration`
//! accessors are what the rest of the workspace uses.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Session lock settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Bounds both waiting for the session lock and holding it.
    /// Default: 30000
    #[serde(default = "LockConfig::default_timeout_ms")]
    pub default_timeout_ms: u64,
}

impl LockConfig {
    fn default_timeout_ms() -> u64 {
        30_000
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: Self::default_timeout_ms(),
        }
    }
}

/// Per-operation session budgets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sessions are stopped automatically after this long. 0 disables the limit.
    /// Default: 3600
    #[serde(default = "SessionConfig::default_max_duration_secs")]
    pub max_duration_secs: u64,

    /// Default: 10000
    #[serde(default = "SessionConfig::default_start_timeout_ms")]
    pub start_timeout_ms: u64,

    /// Default: 15000
    #[serde(default = "SessionConfig::default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Pause and resume.
    /// Default: 5000
    #[serde(default = "SessionConfig::default_control_timeout_ms")]
    pub control_timeout_ms: u64,

    /// Writing session metadata.
    /// Default: 5000
    #[serde(default = "SessionConfig::default_persist_timeout_ms")]
    pub persist_timeout_ms: u64,

    /// Default: 60000
    #[serde(default = "SessionConfig::default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl SessionConfig {
    fn default_max_duration_secs() -> u64 {
        3600
    }

    fn default_start_timeout_ms() -> u64 {
        10_000
    }

    fn default_stop_timeout_ms() -> u64 {
        15_000
    }

    fn default_control_timeout_ms() -> u64 {
        5_000
    }

    fn default_persist_timeout_ms() -> u64 {
        5_000
    }

    fn default_shutdown_timeout_ms() -> u64 {
        60_000
    }

    pub fn max_duration(&self) -> Option<Duration> {
        (self.max_duration_secs > 0).then(|| Duration::from_secs(self.max_duration_secs))
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }

    pub fn persist_timeout(&self) -> Duration {
        Duration::from_millis(self.persist_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: Self::default_max_duration_secs(),
            start_timeout_ms: Self::default_start_timeout_ms(),
            stop_timeout_ms: Self::default_stop_timeout_ms(),
            control_timeout_ms: Self::default_control_timeout_ms(),
            persist_timeout_ms: Self::default_persist_timeout_ms(),
            shutdown_timeout_ms: Self::default_shutdown_timeout_ms(),
        }
    }
}

/// Shape of the delay between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    #[default]
    Exponential,
    Linear,
}

impl RetryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStrategy::Exponential => "exponential",
            RetryStrategy::Linear => "linear",
        }
    }
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetryStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exponential" => Ok(RetryStrategy::Exponential),
            "linear" => Ok(RetryStrategy::Linear),
            other => Err(format!(
                "unknown retry strategy '{}' (expected exponential or linear)",
                other
            )),
        }
    }
}

/// Retry policy for collaborator calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    /// Default: 2
    #[serde(default = "RetryConfig::default_max_retries")]
    pub max_retries: u32,

    /// Default: exponential
    #[serde(default)]
    pub strategy: RetryStrategy,

    /// First delay.
    /// Default: 200
    #[serde(default = "RetryConfig::default_base_ms")]
    pub base_ms: u64,

    /// Added per attempt by the linear strategy.
    /// Default: 200
    #[serde(default = "RetryConfig::default_increment_ms")]
    pub increment_ms: u64,

    /// Cap for any single delay.
    /// Default: 5000
    #[serde(default = "RetryConfig::default_max_ms")]
    pub max_ms: u64,
}

impl RetryConfig {
    fn default_max_retries() -> u32 {
        2
    }

    fn default_base_ms() -> u64 {
        200
    }

    fn default_increment_ms() -> u64 {
        200
    }

    fn default_max_ms() -> u64 {
        5_000
    }

    pub fn base(&self) -> Duration {
        Duration::from_millis(self.base_ms)
    }

    pub fn increment(&self) -> Duration {
        Duration::from_millis(self.increment_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: Self::default_max_retries(),
            strategy: RetryStrategy::default(),
            base_ms: Self::default_base_ms(),
            increment_ms: Self::default_increment_ms(),
            max_ms: Self::default_max_ms(),
        }
    }
}
