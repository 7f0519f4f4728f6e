//! Error types for budget accounting.

use ctx_primitives::ConsumerId;
use thiserror::Error;

/// Result alias for budget operations.
pub type BudgetResult<T> = Result<T, BudgetError>;

/// Errors raised by the [`TokenBudgetManager`](crate::TokenBudgetManager).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BudgetError {
    /// The consumer was never registered or has been deregistered.
    #[error("unknown consumer `{consumer}`")]
    UnknownConsumer {
        /// Offending consumer identifier.
        consumer: ConsumerId,
    },
    /// The reservation does not fit the remaining window.
    #[error("insufficient budget: requested {requested} tokens, {available} available")]
    Insufficient {
        /// Tokens asked for.
        requested: usize,
        /// Tokens left at the time of the request.
        available: usize,
    },
}

impl BudgetError {
    pub(crate) fn unknown(consumer: &ConsumerId) -> Self {
        Self::UnknownConsumer {
            consumer: consumer.clone(),
        }
    }
}
