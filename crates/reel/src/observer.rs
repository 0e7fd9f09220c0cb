//! Telemetry side channel.
//!
//! Observers see what happened; they never influence control flow. Results and errors
//! still come back through the controller's return values.

use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

use crate::session::{EndReason, SessionId};
use crate::state::ControllerState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        from: ControllerState,
        to: ControllerState,
    },
    SessionStarted {
        session_id: SessionId,
    },
    SessionStopped {
        session_id: SessionId,
        reason: EndReason,
        frame_count: Option<u64>,
    },
    PersistFailed {
        session_id: SessionId,
        error: String,
    },
}

/// Receives events synchronously, after the controller's internal state is updated.
pub trait SessionObserver: Send + Sync {
    fn on_event(&self, event: &SessionEvent);
}

/// Logs every event at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl SessionObserver for TracingObserver {
    fn on_event(&self, event: &SessionEvent) {
        match serde_json::to_string(event) {
            Ok(json) => debug!(event = %json, "session event"),
            Err(_) => debug!(event = ?event, "session event"),
        }
    }
}

/// Collects events in memory.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<SessionEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Just the state changes, as `(from, to)` pairs.
    pub fn transitions(&self) -> Vec<(ControllerState, ControllerState)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SessionEvent::StateChanged { from, to } => Some((from, to)),
                _ => None,
            })
            .collect()
    }
}

impl SessionObserver for EventLog {
    fn on_event(&self, event: &SessionEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}
