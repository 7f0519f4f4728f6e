//! Contract implemented by every consumer integration.

use std::collections::BTreeMap;

use async_trait::async_trait;
use ctx_memory::{CompressionLevel, MemoryEntry, Scope};
use ctx_primitives::ConsumerId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias for adapter operations.
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Errors produced by adapters and the adapter registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    /// The consumer refused the change.
    #[error("adapter rejected sync: {reason}")]
    Rejected {
        /// Human-readable reason for rejection.
        reason: String,
    },
    /// The consumer could not be reached.
    #[error("adapter unavailable: {reason}")]
    Unavailable {
        /// Human-readable reason describing the outage.
        reason: String,
    },
    /// An update referenced a key the consumer does not hold.
    #[error("key `{key}` is not present in the consumer")]
    NotFound {
        /// Missing key.
        key: String,
    },
    /// A consumer with the same identifier is already registered.
    #[error("adapter for consumer `{consumer}` is already registered")]
    DuplicateAdapter {
        /// Offending consumer identifier.
        consumer: ConsumerId,
    },
}

impl AdapterError {
    /// Creates a rejection error.
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    /// Creates an availability error.
    #[must_use]
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }
}

/// Usage reported by an adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterStats {
    /// Entries held by the consumer.
    pub entry_count: usize,
    /// Entries per compression level.
    pub compression_level_counts: BTreeMap<CompressionLevel, usize>,
    /// Approximate tokens occupied in the consumer's context window.
    pub estimated_token_usage: usize,
}

/// Projects memory into one consumer's private store and keeps it in sync.
///
/// The engine calls these methods from background tasks; failures are logged
/// and counted but never abort the engine.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    /// Identity of the consumer behind this adapter.
    fn consumer_id(&self) -> &ConsumerId;

    /// Size of the consumer's context window in tokens.
    fn context_window_tokens(&self) -> usize;

    /// Scopes the consumer may read. Defaults to every scope.
    fn readable_scopes(&self) -> &[Scope] {
        &Scope::ALL
    }

    /// Adds a newly projected entry.
    async fn sync_create(&self, key: &str, entry: &MemoryEntry) -> AdapterResult<()>;

    /// Replaces a projected entry.
    async fn sync_update(&self, key: &str, entry: &MemoryEntry) -> AdapterResult<()>;

    /// Removes a projected entry. Missing keys are not an error.
    async fn sync_delete(&self, key: &str) -> AdapterResult<()>;

    /// Entries currently held by the consumer.
    async fn entry_count(&self) -> usize;

    /// Reports usage.
    async fn stats(&self) -> AdapterResult<AdapterStats>;
}
