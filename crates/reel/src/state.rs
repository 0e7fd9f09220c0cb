//! Controller lifecycle states and the legal moves between them.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    /// Not initialized, or shut down.
    Idle,
    Initializing,
    /// Initialized, no session.
    Ready,
    Recording,
    Paused,
    /// Stopping capture and writing metadata.
    Analyzing,
    /// A collaborator failed; only `shutdown` leaves this state.
    Error,
}

impl ControllerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerState::Idle => "idle",
            ControllerState::Initializing => "initializing",
            ControllerState::Ready => "ready",
            ControllerState::Recording => "recording",
            ControllerState::Paused => "paused",
            ControllerState::Analyzing => "analyzing",
            ControllerState::Error => "error",
        }
    }

    /// The single source of truth for transitions.
    ///
    /// Every non-idle state may drop to `Idle`, which is how `shutdown` recovers from
    /// anything.
    pub fn can_transition_to(&self, to: ControllerState) -> bool {
        use ControllerState::*;

        if to == Idle {
            return *self != Idle;
        }

        matches!(
            (self, to),
            (Idle, Initializing)
                | (Initializing, Ready)
                | (Initializing, Error)
                | (Ready, Recording)
                | (Ready, Error)
                | (Recording, Paused)
                | (Recording, Analyzing)
                | (Paused, Recording)
                | (Paused, Analyzing)
                | (Analyzing, Ready)
                | (Analyzing, Error)
        )
    }

    /// Initialized and able to serve session operations.
    pub fn is_initialized(&self) -> bool {
        matches!(
            self,
            ControllerState::Ready
                | ControllerState::Recording
                | ControllerState::Paused
                | ControllerState::Analyzing
        )
    }

    /// A session exists in this state.
    pub fn has_session(&self) -> bool {
        matches!(
            self,
            ControllerState::Recording | ControllerState::Paused | ControllerState::Analyzing
        )
    }
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
