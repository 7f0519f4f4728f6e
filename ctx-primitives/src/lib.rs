//! Core shared types for the context synchronization engine.

#![warn(missing_docs, clippy::pedantic)]

mod error;
mod ids;

/// Error type and result alias shared across the workspace.
pub use error::{Error, Result};
/// Identifier of a memory consumer (a tool with its own context window).
pub use ids::ConsumerId;
