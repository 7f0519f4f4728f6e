//! Consumer integration points.
//!
//! A [`ToolAdapter`] projects shared memory into one consumer's private store.
//! Adapters are registered in an [`AdapterRegistry`], which also tracks how many
//! sync calls failed per consumer. [`LocalToolAdapter`] mirrors entries in
//! process.

#![warn(missing_docs, clippy::pedantic)]

mod adapter;
mod local;
mod registry;

pub use adapter::{AdapterError, AdapterResult, AdapterStats, ToolAdapter};
pub use local::LocalToolAdapter;
pub use registry::{AdapterHandle, AdapterRegistry, AdapterReport};
