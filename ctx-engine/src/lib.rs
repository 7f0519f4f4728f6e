//! Tiered cache manager, consumer synchronization, and engine lifecycle.
//!
//! [`SyncEngine`] owns the hot tier, the write-behind warm and cold tiers, the
//! vector batch queue, and one view per registered consumer. Producers call
//! [`SyncEngine::store`]; consumers read through [`SyncEngine::retrieve`] or
//! receive budget-fitted projections via [`SyncEngine::sync_consumer`].

#![warn(missing_docs, clippy::pedantic)]

mod background;
mod cache;
mod engine;
mod error;
mod lifecycle;
mod persist;
mod scheduler;
mod views;

pub use background::ReapReport;
pub use cache::{SearchHit, StoreOutcome, StoreRequest};
pub use engine::{ConsumerStats, EngineStats, SyncEngine, SyncEngineBuilder};
pub use error::{EngineError, EngineResult};
pub use lifecycle::{EngineState, Lifecycle, LifecycleError, LifecycleEvent, LifecycleResult};
pub use scheduler::{SchedulerError, SchedulerResult, TaskScheduler};
pub use views::SyncReport;
