//! Bounded, retried, cancellable operations.
//!
//! A [`BoundedOperation`] describes how to run one piece of I/O: its overall timeout,
//! how many times to retry, and how long to wait in between. Each `execute` call gets
//! its own signal, parented to the caller's signal when one is given, so cancelling a
//! session also cancels every call made on its behalf.
//!
//! Cancellation always wins over a result that becomes ready at the same time, and a
//! cancelled operation is never retried.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backoff::{Backoff, BackoffStrategy};
use crate::error::{Cancelled, OperationError};
use crate::signal::{CancellationSignal, SignalWatcher};

#[derive(Clone)]
pub struct BoundedOperation {
    name: String,
    timeout: Duration,
    max_retries: u32,
    backoff: Arc<dyn BackoffStrategy>,
    parent: Option<SignalWatcher>,
}

impl BoundedOperation {
    /// 30s overall timeout, 3 retries, exponential backoff from 100ms capped at 5s.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            backoff: Arc::new(Backoff::default()),
            parent: None,
        }
    }

    /// Bound on the whole call, retries and backoff included.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, backoff: impl BackoffStrategy + 'static) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    /// Cancel the call whenever `parent` cancels.
    pub fn with_signal(mut self, parent: &SignalWatcher) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    pub fn with_signal_opt(mut self, parent: Option<&SignalWatcher>) -> Self {
        self.parent = parent.cloned();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Run `work` until it succeeds, runs out of attempts, or is cancelled.
    ///
    /// `work` receives the per-call signal so it can register cleanup or check for
    /// cancellation at its own await points. Returning a [`Cancelled`] error (directly
    /// or via `anyhow`) is treated as cancellation, not as a retryable failure.
    pub async fn execute<T, F, Fut>(&self, mut work: F) -> Result<T, OperationError>
    where
        F: FnMut(SignalWatcher) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let started = Instant::now();
        let max_attempts = self.max_retries.saturating_add(1);
        let signal = CancellationSignal::builder()
            .label(self.name.clone())
            .parent_opt(self.parent.as_ref())
            .timeout(self.timeout)
            .build();

        debug!(
            operation = %self.name,
            timeout_ms = self.timeout.as_millis() as u64,
            max_attempts,
            "operation started"
        );

        let mut attempt: u32 = 0;
        loop {
            if let Err(cancelled) = signal.check() {
                return Err(self.cancelled(attempt, cancelled, started));
            }
            attempt += 1;

            let result = tokio::select! {
                biased;
                cancelled = signal.cancelled() => {
                    return Err(self.cancelled(attempt, cancelled, started));
                }
                result = work(signal.watcher()) => result,
            };

            let err = match result {
                Ok(value) => {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    if attempt > 1 {
                        info!(operation = %self.name, attempt, elapsed_ms, "operation succeeded after retry");
                    } else {
                        debug!(operation = %self.name, elapsed_ms, "operation succeeded");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if let Some(cancelled) = err.downcast_ref::<Cancelled>() {
                return Err(self.cancelled(attempt, cancelled.clone(), started));
            }
            if let Some(cancelled) = signal.cancellation() {
                return Err(self.cancelled(attempt, cancelled, started));
            }

            if attempt >= max_attempts {
                let elapsed = started.elapsed();
                error!(
                    operation = %self.name,
                    attempts = attempt,
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %format!("{err:#}"),
                    "operation failed"
                );
                return Err(OperationError::Failed {
                    operation: self.name.clone(),
                    attempts: attempt,
                    elapsed,
                    last_error: err,
                });
            }

            let delay = self.backoff.delay(attempt);
            warn!(
                operation = %self.name,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                elapsed_ms = started.elapsed().as_millis() as u64,
                error = %format!("{err:#}"),
                "attempt failed, retrying"
            );

            tokio::select! {
                biased;
                cancelled = signal.cancelled() => {
                    return Err(self.cancelled(attempt, cancelled, started));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn cancelled(&self, attempts: u32, cancelled: Cancelled, started: Instant) -> OperationError {
        info!(
            operation = %self.name,
            attempts,
            origin = %cancelled.origin,
            reason = %cancelled.reason,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "operation cancelled"
        );
        OperationError::Cancelled {
            operation: self.name.clone(),
            attempts,
            cancelled,
        }
    }
}

impl std::fmt::Debug for BoundedOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedOperation")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("parent", &self.parent.as_ref().map(|p| p.label().to_string()))
            .finish()
    }
}
