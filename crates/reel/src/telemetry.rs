//! Tracing subscriber setup.

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber.
///
/// `filter` is an `EnvFilter` directive string, normally `telemetry.log_level` from
/// the loaded config (which already folds in `RUST_LOG`).
pub fn init(filter: &str) -> Result<()> {
    let env_filter = EnvFilter::try_new(filter)
        .with_context(|| format!("Invalid log filter '{}'", filter))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    tracing::debug!(filter, "tracing initialized");
    Ok(())
}
