//! Session run state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a session is in the generate → dispatch flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Recipients loaded, nothing generated yet.
    Idle,
    /// A generation run is in flight.
    Generating,
    /// Generated messages are merged and ready for review or dispatch.
    Reconciled,
    /// A dispatch is in flight.
    Dispatching,
    /// The last dispatch finished.
    Done,
    /// The last run ended with a fatal error (session expiry).
    Failed,
}

impl RunState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: RunState) -> bool {
        use RunState::*;

        matches!(
            (self, target),
            // Start generating from any settled state
            (Idle, Generating) | (Reconciled, Generating) |
            (Done, Generating) | (Failed, Generating) |
            // Generation ends
            (Generating, Reconciled) | (Generating, Failed) |
            // Dispatch whatever is reconciled, including leftovers
            (Reconciled, Dispatching) | (Done, Dispatching) | (Failed, Dispatching) |
            // Dispatch ends
            (Dispatching, Done) | (Dispatching, Failed) |
            // Reload recipients
            (Reconciled, Idle) | (Done, Idle) | (Failed, Idle)
        )
    }

    /// A run is in flight.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Generating | Self::Dispatching)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Generating => "generating",
            Self::Reconciled => "reconciled",
            Self::Dispatching => "dispatching",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: RunState,
    pub to: RunState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}
