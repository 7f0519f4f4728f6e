//! Lifecycle state machine for the sync engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// States the engine moves through between construction and shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// Components built; background loops not started.
    Created,
    /// Accepting writes and running background loops.
    Running,
    /// Loops stopping and queues draining; writes are refused.
    Draining,
    /// Fully stopped; nothing further is scheduled.
    Stopped,
}

impl EngineState {
    /// Returns `true` while the engine accepts work.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }

    /// Returns `true` once the engine has stopped.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped)
    }
}

/// Events that trigger lifecycle transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Start background loops.
    Start,
    /// Begin a graceful shutdown.
    Drain,
    /// Finalize shutdown after draining.
    Stop,
}

/// Lifecycle state manager.
#[derive(Debug, Clone, Copy)]
pub struct Lifecycle {
    state: EngineState,
}

impl Lifecycle {
    /// Constructs a controller in [`EngineState::Created`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: EngineState::Created,
        }
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> EngineState {
        self.state
    }

    /// Applies a lifecycle event, returning the resulting state.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`] when the supplied event is not
    /// allowed from the current state.
    pub fn transition(&mut self, event: LifecycleEvent) -> LifecycleResult<EngineState> {
        let next = match (self.state, event) {
            (EngineState::Created, LifecycleEvent::Start) => Some(EngineState::Running),
            (EngineState::Created | EngineState::Running, LifecycleEvent::Drain) => {
                Some(EngineState::Draining)
            }
            (EngineState::Draining | EngineState::Stopped, LifecycleEvent::Stop) => {
                Some(EngineState::Stopped)
            }
            _ => None,
        };

        let Some(next_state) = next else {
            return Err(LifecycleError::InvalidTransition {
                from: self.state,
                event,
            });
        };

        if next_state != self.state {
            debug!(?self.state, ?next_state, ?event, "engine lifecycle transition");
            self.state = next_state;
        }

        Ok(self.state)
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors emitted by the lifecycle controller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    /// Transition was not permitted from the current state.
    #[error("invalid lifecycle transition from {from:?} via {event:?}")]
    InvalidTransition {
        /// State prior to the attempted transition.
        from: EngineState,
        /// Event that triggered the failure.
        event: LifecycleEvent,
    },
}

/// Result alias used for lifecycle operations.
pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_drain_stop_flow() {
        let mut lifecycle = Lifecycle::new();

        assert_eq!(lifecycle.state(), EngineState::Created);
        lifecycle.transition(LifecycleEvent::Start).unwrap();
        assert!(lifecycle.state().is_running());
        lifecycle.transition(LifecycleEvent::Drain).unwrap();
        assert_eq!(lifecycle.state(), EngineState::Draining);
        lifecycle.transition(LifecycleEvent::Stop).unwrap();
        assert!(lifecycle.state().is_terminal());
    }

    #[test]
    fn stop_is_idempotent() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.transition(LifecycleEvent::Drain).unwrap();
        lifecycle.transition(LifecycleEvent::Stop).unwrap();
        assert_eq!(
            lifecycle.transition(LifecycleEvent::Stop).unwrap(),
            EngineState::Stopped
        );
    }

    #[test]
    fn invalid_transition_errors() {
        let mut lifecycle = Lifecycle::new();

        let err = lifecycle
            .transition(LifecycleEvent::Stop)
            .expect_err("stop should fail from created");
        assert_eq!(
            err,
            LifecycleError::InvalidTransition {
                from: EngineState::Created,
                event: LifecycleEvent::Stop,
            }
        );

        lifecycle.transition(LifecycleEvent::Start).unwrap();
        assert!(lifecycle.transition(LifecycleEvent::Start).is_err());
    }
}
