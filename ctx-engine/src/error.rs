//! Errors returned to engine callers.

use ctx_adapters::AdapterError;
use ctx_budget::BudgetError;
use ctx_config::ConfigError;
use ctx_memory::MemoryError;
use thiserror::Error;

use crate::lifecycle::{EngineState, LifecycleError};
use crate::scheduler::SchedulerError;

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by [`SyncEngine`](crate::SyncEngine).
///
/// Downstream tier, index, and adapter failures are logged and absorbed; only
/// invalid input, lifecycle misuse, and configuration problems reach callers.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The operation needs a running engine.
    #[error("engine is not running (state: {state:?})")]
    NotRunning {
        /// State at the time of the call.
        state: EngineState,
    },
    /// Lifecycle transition was rejected.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    /// Entry validation or storage failure.
    #[error(transparent)]
    Memory(#[from] MemoryError),
    /// Budget accounting failure.
    #[error(transparent)]
    Budget(#[from] BudgetError),
    /// Adapter registration failure.
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    /// Configuration could not be used.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The scheduler refused new work.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl EngineError {
    pub(crate) fn not_running(state: EngineState) -> Self {
        Self::NotRunning { state }
    }
}
