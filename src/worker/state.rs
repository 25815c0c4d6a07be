//! Coordinator state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WorkerError;

/// Maximum number of transitions kept in memory.
const MAX_TRANSITIONS: usize = 200;

/// State of a worker coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    /// Waiting for the next tick or trigger.
    Idle,
    /// A cycle is in progress.
    Running,
    /// A pause was observed at cycle start; waiting for the next tick.
    Paused,
    /// Shut down. No further cycles.
    Stopped,
}

impl CoordinatorState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: CoordinatorState) -> bool {
        use CoordinatorState::*;

        matches!(
            (self, target),
            (Idle, Running) | (Paused, Running) |
            (Running, Idle) | (Running, Paused) |
            (Idle, Stopped) | (Running, Stopped) | (Paused, Stopped)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Whether a manual trigger may start a cycle from this state.
    pub fn accepts_trigger(&self) -> bool {
        matches!(self, Self::Idle | Self::Paused)
    }
}

impl std::fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: CoordinatorState,
    pub to: CoordinatorState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Current state plus a bounded transition history.
#[derive(Debug, Clone, Serialize)]
pub struct StateMachine {
    state: CoordinatorState,
    transitions: Vec<StateTransition>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: CoordinatorState::Idle,
            transitions: Vec::new(),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn transitions(&self) -> &[StateTransition] {
        &self.transitions
    }

    /// Transition to a new state, rejecting moves the table does not allow.
    pub fn transition_to(
        &mut self,
        target: CoordinatorState,
        reason: Option<String>,
    ) -> Result<(), WorkerError> {
        if !self.state.can_transition_to(target) {
            return Err(WorkerError::InvalidTransition {
                state: self.state.to_string(),
                target: target.to_string(),
            });
        }

        self.transitions.push(StateTransition {
            from: self.state,
            to: target,
            timestamp: Utc::now(),
            reason,
        });
        if self.transitions.len() > MAX_TRANSITIONS {
            let drain_count = self.transitions.len() - MAX_TRANSITIONS;
            self.transitions.drain(..drain_count);
        }

        self.state = target;
        Ok(())
    }
}
