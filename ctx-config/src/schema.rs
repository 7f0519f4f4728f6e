//! Strongly typed configuration schema.
//!
//! Every field has a serde default, so an empty document is a valid
//! configuration. Durations are expressed as integer `*_secs` / `*_ms` fields.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration of the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default lifetimes per scope and category.
    #[serde(default)]
    pub retention: RetentionConfig,
    /// In-process hot tier.
    #[serde(default)]
    pub hot: HotConfig,
    /// TTL-bounded warm tier.
    #[serde(default)]
    pub warm: WarmConfig,
    /// Durable cold tier.
    #[serde(default)]
    pub cold: ColdConfig,
    /// Vector batch queue.
    #[serde(default)]
    pub vector: VectorConfig,
    /// Token estimation.
    #[serde(default)]
    pub budget: BudgetConfig,
    /// Compression strategy parameters.
    #[serde(default)]
    pub compression: CompressionConfig,
    /// Relevance decay used when ranking entries.
    #[serde(default)]
    pub relevance: RelevanceConfig,
    /// Background task scheduler.
    #[serde(default)]
    pub scheduler: SchedulerSection,
    /// Reaper ticks between durable sweeps of the warm and cold tiers.
    #[serde(default = "default_durable_sweep_every")]
    pub durable_sweep_every: u32,
    /// Logging.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    /// Health thresholds.
    #[serde(default)]
    pub health: HealthConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retention: RetentionConfig::default(),
            hot: HotConfig::default(),
            warm: WarmConfig::default(),
            cold: ColdConfig::default(),
            vector: VectorConfig::default(),
            budget: BudgetConfig::default(),
            compression: CompressionConfig::default(),
            relevance: RelevanceConfig::default(),
            scheduler: SchedulerSection::default(),
            durable_sweep_every: default_durable_sweep_every(),
            telemetry: TelemetryConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

fn default_durable_sweep_every() -> u32 {
    10
}

/// Default lifetimes per scope plus per-category overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Session scope lifetime in seconds.
    #[serde(default = "default_session_secs")]
    pub session_secs: u64,
    /// Project scope lifetime in seconds.
    #[serde(default = "default_project_secs")]
    pub project_secs: u64,
    /// Global scope lifetime in seconds.
    #[serde(default = "default_global_secs")]
    pub global_secs: u64,
    /// Lifetime overrides in seconds keyed by category.
    #[serde(default)]
    pub categories: HashMap<String, u64>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            session_secs: default_session_secs(),
            project_secs: default_project_secs(),
            global_secs: default_global_secs(),
            categories: HashMap::new(),
        }
    }
}

fn default_session_secs() -> u64 {
    60 * 60
}

fn default_project_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_global_secs() -> u64 {
    30 * 24 * 60 * 60
}

/// Hot tier sizing and reaping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotConfig {
    /// Maximum resident entries.
    #[serde(default = "default_hot_max_entries")]
    pub max_entries: usize,
    /// Cap on the hot lifetime of entries promoted from colder tiers, in seconds.
    #[serde(default = "default_hot_ttl_secs")]
    pub default_ttl_secs: u64,
    /// Reaper period in milliseconds.
    #[serde(default = "default_reaper_interval_ms")]
    pub reaper_interval_ms: u64,
}

impl HotConfig {
    /// Promotion TTL cap as a [`Duration`].
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    /// Reaper period as a [`Duration`].
    #[must_use]
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }
}

impl Default for HotConfig {
    fn default() -> Self {
        Self {
            max_entries: default_hot_max_entries(),
            default_ttl_secs: default_hot_ttl_secs(),
            reaper_interval_ms: default_reaper_interval_ms(),
        }
    }
}

fn default_hot_max_entries() -> usize {
    1024
}

fn default_hot_ttl_secs() -> u64 {
    15 * 60
}

fn default_reaper_interval_ms() -> u64 {
    30_000
}

/// Warm tier bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmConfig {
    /// Upper bound for warm record lifetimes, in seconds.
    #[serde(default = "default_warm_max_ttl_secs")]
    pub max_ttl_secs: u64,
}

impl WarmConfig {
    /// Lifetime cap as a [`Duration`].
    #[must_use]
    pub fn max_ttl(&self) -> Duration {
        Duration::from_secs(self.max_ttl_secs)
    }
}

impl Default for WarmConfig {
    fn default() -> Self {
        Self {
            max_ttl_secs: default_warm_max_ttl_secs(),
        }
    }
}

fn default_warm_max_ttl_secs() -> u64 {
    24 * 60 * 60
}

/// Cold tier location and journal upkeep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColdConfig {
    /// Journal file. Without one the cold tier lives in memory.
    #[serde(default)]
    pub journal_path: Option<PathBuf>,
    /// Journal writes after which the durable sweep compacts the file.
    #[serde(default = "default_compact_after_ops")]
    pub compact_after_ops: usize,
}

impl Default for ColdConfig {
    fn default() -> Self {
        Self {
            journal_path: None,
            compact_after_ops: default_compact_after_ops(),
        }
    }
}

fn default_compact_after_ops() -> usize {
    10_000
}

/// Vector batch queue tuning and collection routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorConfig {
    /// Pending documents that trigger a flush.
    #[serde(default = "default_vector_batch_size")]
    pub batch_size: usize,
    /// Periodic flush interval in milliseconds.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Category to collection routes.
    #[serde(default)]
    pub collections: HashMap<String, String>,
    /// Collection for unrouted categories.
    #[serde(default = "default_collection")]
    pub default_collection: String,
}

impl VectorConfig {
    /// Flush interval as a [`Duration`].
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            batch_size: default_vector_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            collections: HashMap::new(),
            default_collection: default_collection(),
        }
    }
}

fn default_vector_batch_size() -> usize {
    32
}

fn default_flush_interval_ms() -> u64 {
    5_000
}

fn default_collection() -> String {
    "memories".to_string()
}

/// Token estimation ratio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Bytes counted as one token.
    #[serde(default = "default_bytes_per_token")]
    pub bytes_per_token: usize,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            bytes_per_token: default_bytes_per_token(),
        }
    }
}

fn default_bytes_per_token() -> usize {
    4
}

/// Lossy compression parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Fraction of characters removed at the light level, in `(0, 1)`.
    #[serde(default = "default_light_reduction")]
    pub light_reduction: f64,
    /// Characters kept at the heavy level.
    #[serde(default = "default_heavy_excerpt_chars")]
    pub heavy_excerpt_chars: usize,
    /// Suffix appended to truncated content.
    #[serde(default = "default_marker")]
    pub marker: String,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            light_reduction: default_light_reduction(),
            heavy_excerpt_chars: default_heavy_excerpt_chars(),
            marker: default_marker(),
        }
    }
}

fn default_light_reduction() -> f64 {
    0.5
}

fn default_heavy_excerpt_chars() -> usize {
    200
}

fn default_marker() -> String {
    "...".to_string()
}

/// Relevance decay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelevanceConfig {
    /// Half-life of relevance in seconds; zero disables decay.
    #[serde(default = "default_half_life_secs")]
    pub half_life_secs: u64,
}

impl RelevanceConfig {
    /// Half-life as a [`Duration`].
    #[must_use]
    pub fn half_life(&self) -> Duration {
        Duration::from_secs(self.half_life_secs)
    }
}

impl Default for RelevanceConfig {
    fn default() -> Self {
        Self {
            half_life_secs: default_half_life_secs(),
        }
    }
}

fn default_half_life_secs() -> u64 {
    24 * 60 * 60
}

/// Background task concurrency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerSection {
    /// Background tasks allowed to run at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
        }
    }
}

fn default_max_concurrency() -> usize {
    64
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}

/// Limits beyond which the engine reports itself degraded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Pending vector documents.
    #[serde(default = "default_max_pending_vectors")]
    pub max_pending_vectors: usize,
    /// Failed vector batches since start.
    #[serde(default = "default_max_failed_batches")]
    pub max_failed_batches: u64,
    /// Adapter sync failures since start.
    #[serde(default = "default_max_adapter_failures")]
    pub max_adapter_failures: u64,
    /// Writes waiting for warm/cold persistence.
    #[serde(default = "default_max_persist_backlog")]
    pub max_persist_backlog: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_pending_vectors: default_max_pending_vectors(),
            max_failed_batches: default_max_failed_batches(),
            max_adapter_failures: default_max_adapter_failures(),
            max_persist_backlog: default_max_persist_backlog(),
        }
    }
}

fn default_max_pending_vectors() -> usize {
    1_000
}

fn default_max_failed_batches() -> u64 {
    10
}

fn default_max_adapter_failures() -> u64 {
    100
}

fn default_max_persist_backlog() -> usize {
    10_000
}
