//! Token budgeting and context window optimization.
//!
//! [`TokenBudgetManager`] keeps per-consumer reservations, [`CompressionTable`]
//! holds the lossy strategies, and [`ContextOptimizer`] combines both to decide
//! which entries a consumer receives and at what compression level.

#![warn(missing_docs, clippy::pedantic)]

mod budget;
mod compression;
mod error;
mod optimizer;
mod tokens;

pub use budget::{BudgetSnapshot, TokenBudgetManager};
pub use compression::{CompressionParams, CompressionTable, Strategy};
pub use error::{BudgetError, BudgetResult};
pub use optimizer::{ContextOptimizer, ProjectedEntry, Projection, ProjectionStats};
pub use tokens::{DEFAULT_BYTES_PER_TOKEN, TokenEstimator};
