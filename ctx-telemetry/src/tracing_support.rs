//! Structured tracing helpers.

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Builds the filter from `RUST_LOG`, falling back to `default_directive`.
///
/// # Errors
///
/// Fails when `RUST_LOG` is unset and `default_directive` does not parse.
pub fn env_filter(default_directive: &str) -> anyhow::Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(default_directive)
            .with_context(|| format!("invalid log filter `{default_directive}`")),
    }
}

/// Installs a global fmt subscriber.
///
/// Returns `false` when a subscriber was already installed; the existing one
/// is kept.
///
/// # Errors
///
/// Propagates filter parsing failures from [`env_filter`].
pub fn init(default_directive: &str) -> anyhow::Result<bool> {
    let filter = env_filter(default_directive)?;
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .is_ok();
    Ok(installed)
}
