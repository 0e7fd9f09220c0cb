//! Config file discovery, loading, and environment variable overlay.
//!
//! Each file is applied on top of what came before it, key by key, so a local file
//! that only sets `retry.max_retries` leaves everything else from the user file alone.

use crate::limits::RetryStrategy;
use crate::{ConfigError, ReelConfig};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local). Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local `./reel.toml`.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/reel/config.toml");
    if system.exists() {
        files.push(system);
    }

    // XDG_CONFIG_HOME or ~/.config
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("reel/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("reel.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a TOML file and apply it on top of `config`.
pub fn apply_file(config: &mut ReelConfig, path: &Path) -> Result<(), ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    apply_toml(config, &contents, path)
}

/// Apply TOML text on top of `config`. `path` is only used in error messages.
pub fn apply_toml(config: &mut ReelConfig, contents: &str, path: &Path) -> Result<(), ConfigError> {
    let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let fields = TableReader { table: &table, path };

    if let Some(v) = fields.u64("lock", "default_timeout_ms")? {
        config.lock.default_timeout_ms = v;
    }

    if let Some(v) = fields.u64("session", "max_duration_secs")? {
        config.session.max_duration_secs = v;
    }
    if let Some(v) = fields.u64("session", "start_timeout_ms")? {
        config.session.start_timeout_ms = v;
    }
    if let Some(v) = fields.u64("session", "stop_timeout_ms")? {
        config.session.stop_timeout_ms = v;
    }
    if let Some(v) = fields.u64("session", "control_timeout_ms")? {
        config.session.control_timeout_ms = v;
    }
    if let Some(v) = fields.u64("session", "persist_timeout_ms")? {
        config.session.persist_timeout_ms = v;
    }
    if let Some(v) = fields.u64("session", "shutdown_timeout_ms")? {
        config.session.shutdown_timeout_ms = v;
    }

    if let Some(v) = fields.u64("retry", "max_retries")? {
        config.retry.max_retries = u32::try_from(v).map_err(|_| fields.invalid("retry", "max_retries", "is too large"))?;
    }
    if let Some(v) = fields.str("retry", "strategy")? {
        config.retry.strategy = RetryStrategy::from_str(v)
            .map_err(|message| fields.invalid("retry", "strategy", &message))?;
    }
    if let Some(v) = fields.u64("retry", "base_ms")? {
        config.retry.base_ms = v;
    }
    if let Some(v) = fields.u64("retry", "increment_ms")? {
        config.retry.increment_ms = v;
    }
    if let Some(v) = fields.u64("retry", "max_ms")? {
        config.retry.max_ms = v;
    }

    if let Some(v) = fields.str("paths", "metadata_dir")? {
        config.paths.metadata_dir = expand_path(v);
    }

    if let Some(v) = fields.str("telemetry", "log_level")? {
        config.telemetry.log_level = v.to_string();
    }

    Ok(())
}

struct TableReader<'a> {
    table: &'a toml::Table,
    path: &'a Path,
}

impl<'a> TableReader<'a> {
    fn value(&self, section: &str, key: &str) -> Option<&'a toml::Value> {
        self.table
            .get(section)
            .and_then(|v| v.as_table())
            .and_then(|t| t.get(key))
    }

    fn u64(&self, section: &str, key: &str) -> Result<Option<u64>, ConfigError> {
        match self.value(section, key) {
            None => Ok(None),
            Some(v) => v
                .as_integer()
                .and_then(|n| u64::try_from(n).ok())
                .map(Some)
                .ok_or_else(|| self.invalid(section, key, "must be a non-negative integer")),
        }
    }

    fn str(&self, section: &str, key: &str) -> Result<Option<&'a str>, ConfigError> {
        match self.value(section, key) {
            None => Ok(None),
            Some(v) => v
                .as_str()
                .map(Some)
                .ok_or_else(|| self.invalid(section, key, "must be a string")),
        }
    }

    fn invalid(&self, section: &str, key: &str, message: &str) -> ConfigError {
        ConfigError::Parse {
            path: self.path.to_path_buf(),
            message: format!("{}.{} {}", section, key, message),
        }
    }
}

/// Apply `REEL_*` / `RUST_LOG` overrides from the process environment.
pub fn apply_env_overrides(
    config: &mut ReelConfig,
    sources: &mut ConfigSources,
) -> Result<(), ConfigError> {
    apply_env_overrides_from(config, sources, env::vars())
}

/// Apply overrides from an explicit set of variables.
pub fn apply_env_overrides_from<I>(
    config: &mut ReelConfig,
    sources: &mut ConfigSources,
    vars: I,
) -> Result<(), ConfigError>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut rust_log = None;

    for (key, value) in vars {
        let applied = match key.as_str() {
            "REEL_LOCK_TIMEOUT_MS" => {
                config.lock.default_timeout_ms = parse_env(&key, &value)?;
                true
            }
            "REEL_MAX_DURATION_SECS" => {
                config.session.max_duration_secs = parse_env(&key, &value)?;
                true
            }
            "REEL_START_TIMEOUT_MS" => {
                config.session.start_timeout_ms = parse_env(&key, &value)?;
                true
            }
            "REEL_STOP_TIMEOUT_MS" => {
                config.session.stop_timeout_ms = parse_env(&key, &value)?;
                true
            }
            "REEL_CONTROL_TIMEOUT_MS" => {
                config.session.control_timeout_ms = parse_env(&key, &value)?;
                true
            }
            "REEL_PERSIST_TIMEOUT_MS" => {
                config.session.persist_timeout_ms = parse_env(&key, &value)?;
                true
            }
            "REEL_SHUTDOWN_TIMEOUT_MS" => {
                config.session.shutdown_timeout_ms = parse_env(&key, &value)?;
                true
            }
            "REEL_MAX_RETRIES" => {
                config.retry.max_retries = parse_env(&key, &value)?;
                true
            }
            "REEL_RETRY_STRATEGY" => {
                config.retry.strategy = parse_env(&key, &value)?;
                true
            }
            "REEL_RETRY_BASE_MS" => {
                config.retry.base_ms = parse_env(&key, &value)?;
                true
            }
            "REEL_RETRY_INCREMENT_MS" => {
                config.retry.increment_ms = parse_env(&key, &value)?;
                true
            }
            "REEL_RETRY_MAX_MS" => {
                config.retry.max_ms = parse_env(&key, &value)?;
                true
            }
            "REEL_METADATA_DIR" => {
                config.paths.metadata_dir = expand_path(&value);
                true
            }
            "REEL_LOG_LEVEL" => {
                config.telemetry.log_level = value.clone();
                true
            }
            "RUST_LOG" => {
                // Applied last so it beats REEL_LOG_LEVEL regardless of iteration order.
                rust_log = Some(value.clone());
                false
            }
            _ => false,
        };

        if applied {
            sources.env_overrides.push(key);
        }
    }

    if let Some(v) = rust_log {
        config.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }

    Ok(())
}

fn parse_env<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Env {
        var: key.to_string(),
        message: e.to_string(),
    })
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            home.join(stripped)
        } else {
            PathBuf::from(path)
        }
    } else if let Some(stripped) = path.strip_prefix('$') {
        // $VAR/rest/of/path
        if let Some(slash_pos) = stripped.find('/') {
            let var_name = &stripped[..slash_pos];
            if let Ok(var_value) = env::var(var_name) {
                PathBuf::from(var_value).join(&stripped[slash_pos + 1..])
            } else {
                PathBuf::from(path)
            }
        } else {
            env::var(stripped)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(path))
        }
    } else {
        PathBuf::from(path)
    }
}
