//! Error types for the memory subsystem.

use serde_json::Error as SerdeError;
use thiserror::Error;

/// Errors emitted by memory components.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// The provided configuration was invalid.
    #[error("invalid memory configuration: {0}")]
    InvalidConfig(&'static str),
    /// Underlying I/O failure while reading or writing journal files.
    #[error("i/o error: {source}")]
    Io {
        /// Source [`std::io::Error`].
        #[from]
        source: std::io::Error,
    },
    /// Serialization or deserialization error.
    #[error("serialization error: {source}")]
    Serialization {
        /// Source [`serde_json::Error`].
        #[from]
        source: SerdeError,
    },
    /// Memory entry failed validation.
    #[error("invalid memory entry: {0}")]
    InvalidEntry(&'static str),
    /// A primitive (such as a consumer id) failed validation.
    #[error(transparent)]
    Primitive(#[from] ctx_primitives::Error),
    /// Storage backend reported a failure.
    #[error("storage backend error: {reason}")]
    Backend {
        /// Human-readable reason describing the failure.
        reason: String,
    },
    /// Vector index service reported a failure for a whole batch.
    #[error("vector index error: {reason}")]
    VectorIndex {
        /// Human-readable reason describing the failure.
        reason: String,
    },
}

impl MemoryError {
    /// Helper to construct backend errors from string-like values.
    #[must_use]
    pub fn backend(reason: impl Into<String>) -> Self {
        Self::Backend {
            reason: reason.into(),
        }
    }

    /// Helper to construct vector index errors from string-like values.
    #[must_use]
    pub fn vector_index(reason: impl Into<String>) -> Self {
        Self::VectorIndex {
            reason: reason.into(),
        }
    }
}

/// Result type alias for memory operations.
pub type MemoryResult<T> = Result<T, MemoryError>;
