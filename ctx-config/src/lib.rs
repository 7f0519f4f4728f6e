//! Configuration for the context synchronization engine.
//!
//! [`EngineConfig`] is deserialized from TOML; every field has a default so
//! partial documents are accepted. Runtime crates take their own small config
//! types, which the engine derives from this schema.

#![warn(missing_docs, clippy::pedantic)]

mod loader;
mod schema;

pub use loader::{ConfigError, ConfigResult};
pub use schema::{
    BudgetConfig, ColdConfig, CompressionConfig, EngineConfig, HealthConfig, HotConfig,
    RelevanceConfig, RetentionConfig, SchedulerSection, TelemetryConfig, VectorConfig, WarmConfig,
};
