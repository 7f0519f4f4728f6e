//! Loading and validating [`EngineConfig`] documents.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::schema::EngineConfig;

/// Result alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors produced while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        /// File that was requested.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The document is not valid TOML for the schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// A field holds an unusable value.
    #[error("invalid config field `{field}`: {reason}")]
    Invalid {
        /// Dotted path of the offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: &'static str) -> Self {
        Self::Invalid { field, reason }
    }
}

impl EngineConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed input and
    /// [`ConfigError::Invalid`] when validation fails.
    pub fn from_toml_str(raw: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses, and validates the TOML file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be read, otherwise the
    /// errors of [`from_toml_str`](Self::from_toml_str).
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&raw)?;
        debug!(path = %path.display(), "engine configuration loaded");
        Ok(config)
    }

    /// Checks value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> ConfigResult<()> {
        let positive: [(&'static str, u64); 13] = [
            ("retention.session_secs", self.retention.session_secs),
            ("retention.project_secs", self.retention.project_secs),
            ("retention.global_secs", self.retention.global_secs),
            ("hot.max_entries", self.hot.max_entries as u64),
            ("hot.default_ttl_secs", self.hot.default_ttl_secs),
            ("hot.reaper_interval_ms", self.hot.reaper_interval_ms),
            ("warm.max_ttl_secs", self.warm.max_ttl_secs),
            ("cold.compact_after_ops", self.cold.compact_after_ops as u64),
            ("vector.batch_size", self.vector.batch_size as u64),
            ("vector.flush_interval_ms", self.vector.flush_interval_ms),
            ("budget.bytes_per_token", self.budget.bytes_per_token as u64),
            ("scheduler.max_concurrency", self.scheduler.max_concurrency as u64),
            ("durable_sweep_every", u64::from(self.durable_sweep_every)),
        ];
        if let Some(&(field, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::invalid(field, "must be greater than zero"));
        }

        if self.retention.categories.values().any(|ttl| *ttl == 0) {
            return Err(ConfigError::invalid(
                "retention.categories",
                "category lifetimes must be greater than zero",
            ));
        }
        if self.compression.heavy_excerpt_chars == 0 {
            return Err(ConfigError::invalid(
                "compression.heavy_excerpt_chars",
                "must be greater than zero",
            ));
        }
        let reduction = self.compression.light_reduction;
        if !(reduction > 0.0 && reduction < 1.0) {
            return Err(ConfigError::invalid(
                "compression.light_reduction",
                "must lie strictly between 0 and 1",
            ));
        }
        if self.vector.default_collection.trim().is_empty()
            || self.vector.collections.values().any(|name| name.trim().is_empty())
        {
            return Err(ConfigError::invalid(
                "vector.collections",
                "collection names must not be empty",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn empty_document_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.hot.max_entries, 1024);
        assert_eq!(config.budget.bytes_per_token, 4);
        assert_eq!(config.durable_sweep_every, 10);
        assert!(config.cold.journal_path.is_none());
    }

    #[test]
    fn parses_sections_and_overrides() {
        let config = EngineConfig::from_toml_str(
            r#"
            durable_sweep_every = 3

            [retention.categories]
            scratch = 120

            [hot]
            max_entries = 2
            reaper_interval_ms = 250

            [vector]
            batch_size = 8
            default_collection = "context"

            [vector.collections]
            code = "snippets"

            [compression]
            light_reduction = 0.25
            marker = " [...]"

            [cold]
            journal_path = "/var/lib/ctxsync/cold.log"
            "#,
        )
        .unwrap();

        assert_eq!(config.durable_sweep_every, 3);
        assert_eq!(config.retention.categories["scratch"], 120);
        assert_eq!(config.hot.max_entries, 2);
        assert_eq!(config.hot.reaper_interval(), Duration::from_millis(250));
        assert_eq!(config.hot.default_ttl(), Duration::from_secs(900));
        assert_eq!(config.vector.collections["code"], "snippets");
        assert_eq!(config.vector.default_collection, "context");
        assert!((config.compression.light_reduction - 0.25).abs() < f64::EPSILON);
        assert_eq!(config.compression.heavy_excerpt_chars, 200);
        assert_eq!(
            config.cold.journal_path.as_deref(),
            Some(Path::new("/var/lib/ctxsync/cold.log"))
        );
    }

    #[test]
    fn rejects_zero_sizes() {
        let err = EngineConfig::from_toml_str("[hot]\nmax_entries = 0\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "hot.max_entries",
                ..
            }
        ));
    }

    #[test]
    fn rejects_reduction_outside_unit_interval() {
        for value in ["0.0", "1.0", "1.5"] {
            let raw = format!("[compression]\nlight_reduction = {value}\n");
            let err = EngineConfig::from_toml_str(&raw).unwrap_err();
            assert!(matches!(
                err,
                ConfigError::Invalid {
                    field: "compression.light_reduction",
                    ..
                }
            ));
        }
    }

    #[test]
    fn reports_parse_and_read_errors() {
        assert!(matches!(
            EngineConfig::from_toml_str("[hot\n"),
            Err(ConfigError::Parse(_))
        ));
        let missing = std::env::temp_dir().join("ctxsync-config-does-not-exist.toml");
        assert!(matches!(
            EngineConfig::load(&missing),
            Err(ConfigError::Read { .. })
        ));
    }
}
