//! Controller errors.

use reelconf::ConfigError;
use thiserror::Error;
use turnstile::{Cancelled, LockTimeout, OperationError};

use crate::state::ControllerState;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Another operation held the session lock for too long.
    #[error(transparent)]
    LockTimeout(#[from] LockTimeout),

    #[error("{operation} cancelled: {cancelled}")]
    Cancelled {
        operation: String,
        #[source]
        cancelled: Cancelled,
    },

    #[error("{operation} failed after {attempts} attempt(s): {last_error:#}")]
    OperationFailed {
        operation: String,
        attempts: u32,
        last_error: anyhow::Error,
    },

    #[error("cannot {operation} while {state}")]
    InvalidStateTransition {
        operation: &'static str,
        state: ControllerState,
    },

    #[error("no active session to {operation}")]
    NotActive { operation: &'static str },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SessionError {
    pub fn is_not_active(&self) -> bool {
        matches!(self, SessionError::NotActive { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SessionError::Cancelled { .. })
    }
}

impl From<OperationError> for SessionError {
    fn from(err: OperationError) -> Self {
        match err {
            OperationError::Cancelled {
                operation,
                cancelled,
                ..
            } => SessionError::Cancelled {
                operation,
                cancelled,
            },
            OperationError::Failed {
                operation,
                attempts,
                last_error,
                ..
            } => SessionError::OperationFailed {
                operation,
                attempts,
                last_error,
            },
        }
    }
}
