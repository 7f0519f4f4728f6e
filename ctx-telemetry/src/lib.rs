//! Observability utilities for the engine.
//!
//! [`tracing_support`] installs the process-wide subscriber and [`health`]
//! turns live metrics into a coarse health verdict.

#![warn(missing_docs, clippy::pedantic)]

pub mod health;
pub mod tracing_support;
