//! Shared error definitions for engine primitives.

use thiserror::Error;

/// Result alias used by primitive constructors.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building primitive types.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Consumer identifier failed validation.
    #[error("invalid consumer id `{id}`: {reason}")]
    InvalidConsumerId {
        /// The offending identifier string.
        id: String,
        /// Human-readable reason for rejection.
        reason: String,
    },
}
