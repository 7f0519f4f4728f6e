//! Tiered memory and context sync engine facade.
//!
//! Depend on this crate via `cargo add ctxsync`. It bundles the workspace
//! crates behind feature flags so embedders can pull in only the pieces they
//! need, for example the budget optimizer without the engine.

#![warn(missing_docs, clippy::pedantic)]

/// Re-export shared primitives for convenience.
pub use ctx_primitives as primitives;

/// Entry model, storage tiers, and the vector queue (enabled by `memory` feature).
#[cfg(feature = "memory")]
pub use ctx_memory as memory;

/// Token budgets, compression, and projection (enabled by `budget` feature).
#[cfg(feature = "budget")]
pub use ctx_budget as budget;

/// Tool adapter contract and registry (enabled by `adapters` feature).
#[cfg(feature = "adapters")]
pub use ctx_adapters as adapters;

/// Configuration schema and loader (enabled by `config` feature).
#[cfg(feature = "config")]
pub use ctx_config as config;

/// Tracing setup and health assessment (enabled by `telemetry` feature).
#[cfg(feature = "telemetry")]
pub use ctx_telemetry as telemetry;

/// The sync engine itself (enabled by `engine` feature).
#[cfg(feature = "engine")]
pub use ctx_engine as engine;

/// Installs the global tracing subscriber using the configured log filter.
///
/// `RUST_LOG` takes precedence over `telemetry.log_filter`. Returns `false`
/// when a subscriber was already installed.
///
/// # Errors
///
/// Fails when the configured filter does not parse.
#[cfg(all(feature = "config", feature = "telemetry"))]
pub fn init_tracing(config: &ctx_config::EngineConfig) -> anyhow::Result<bool> {
    ctx_telemetry::tracing_support::init(&config.telemetry.log_filter)
}
