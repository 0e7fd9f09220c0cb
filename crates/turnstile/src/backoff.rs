//! Retry delay strategies.
//!
//! Delays depend only on the attempt number. Attempt 0 never waits; every strategy is
//! clamped to its `max` so a long retry chain cannot stall for minutes.

use std::time::Duration;

/// Delay to wait after failed attempt `attempt` (1-based) before the next one.
pub trait BackoffStrategy: Send + Sync {
    fn delay(&self, attempt: u32) -> Duration;
}

impl<F> BackoffStrategy for F
where
    F: Fn(u32) -> Duration + Send + Sync,
{
    fn delay(&self, attempt: u32) -> Duration {
        self(attempt)
    }
}

/// Built-in strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `min(base * 2^(attempt-1), max)`
    Exponential { base: Duration, max: Duration },
    /// `min(base + (attempt-1) * increment, max)`
    Linear {
        base: Duration,
        increment: Duration,
        max: Duration,
    },
}

impl Backoff {
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Backoff::Exponential { base, max }
    }

    pub fn linear(base: Duration, increment: Duration, max: Duration) -> Self {
        Backoff::Linear {
            base,
            increment,
            max,
        }
    }

    /// A strategy that retries immediately.
    pub fn none() -> Self {
        Backoff::Linear {
            base: Duration::ZERO,
            increment: Duration::ZERO,
            max: Duration::ZERO,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::exponential(Duration::from_millis(100), Duration::from_secs(5))
    }
}

impl BackoffStrategy for Backoff {
    fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let steps = attempt.saturating_sub(1);
        match *self {
            Backoff::Exponential { base, max } => {
                let multiplier = 2u32.saturating_pow(steps);
                std::cmp::min(base.saturating_mul(multiplier), max)
            }
            Backoff::Linear {
                base,
                increment,
                max,
            } => std::cmp::min(base.saturating_add(increment.saturating_mul(steps)), max),
        }
    }
}
