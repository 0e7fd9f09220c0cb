//! Kernel error types.
//!
//! Cancellation only becomes an error when someone asks for it: `SignalWatcher::check`
//! or a `BoundedOperation` that lost its race. Lock timeouts are always surfaced to the
//! caller and never retried here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// What caused a signal to cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOrigin {
    /// The owner called `cancel`.
    Direct,
    /// Propagated from the parent signal.
    Parent,
    /// The signal's own deadline elapsed.
    Timeout,
    /// Member `n` of a combined signal cancelled first.
    Member(usize),
}

impl std::fmt::Display for CancelOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelOrigin::Direct => write!(f, "direct"),
            CancelOrigin::Parent => write!(f, "parent"),
            CancelOrigin::Timeout => write!(f, "timeout"),
            CancelOrigin::Member(index) => write!(f, "member {}", index),
        }
    }
}

/// A recorded cancellation: why, when, and where it came from.
///
/// This is both what callbacks receive and the error surfaced by `check()`.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("cancelled ({origin}): {reason}")]
pub struct Cancelled {
    pub reason: String,
    pub at: DateTime<Utc>,
    pub origin: CancelOrigin,
}

impl Cancelled {
    pub fn new(reason: impl Into<String>, origin: CancelOrigin) -> Self {
        Self {
            reason: reason.into(),
            at: Utc::now(),
            origin,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.origin == CancelOrigin::Timeout
    }
}

/// A queued `acquire` was not granted before its timeout.
#[derive(Debug, Clone, Error)]
#[error(
    "lock '{lock}' not granted to {owner} within {}ms (held by {})",
    .timeout.as_millis(),
    .holder.as_deref().unwrap_or("nobody")
)]
pub struct LockTimeout {
    pub lock: String,
    pub owner: String,
    pub timeout: Duration,
    /// Holder at the moment the waiter gave up.
    pub holder: Option<String>,
}

/// Terminal outcome of a `BoundedOperation` that did not succeed.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error("operation '{operation}' cancelled after {attempts} attempt(s): {cancelled}")]
    Cancelled {
        operation: String,
        attempts: u32,
        #[source]
        cancelled: Cancelled,
    },

    #[error("operation '{operation}' failed after {attempts} attempt(s): {last_error:#}")]
    Failed {
        operation: String,
        attempts: u32,
        elapsed: Duration,
        last_error: anyhow::Error,
    },
}

impl OperationError {
    pub fn operation(&self) -> &str {
        match self {
            OperationError::Cancelled { operation, .. } | OperationError::Failed { operation, .. } => {
                operation
            }
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            OperationError::Cancelled { attempts, .. } | OperationError::Failed { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, OperationError::Cancelled { .. })
    }
}
