//! Frame capture collaborator.
//!
//! The controller owns exactly one [`CaptureService`]. Every call goes through a
//! `BoundedOperation`, so implementations do not need their own timeouts; they do need
//! to tolerate their futures being dropped mid-call.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Options for a new session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureOptions {
    pub label: Option<String>,
    pub frames_per_second: u32,
    /// Overrides `session.max_duration_secs` for this session.
    pub max_duration: Option<Duration>,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            label: None,
            frames_per_second: 30,
            max_duration: None,
        }
    }
}

impl CaptureOptions {
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = Some(max_duration);
        self
    }
}

/// Identifies a running capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureHandle {
    pub capture_id: String,
    pub started_at: DateTime<Utc>,
}

impl CaptureHandle {
    pub fn new(capture_id: impl Into<String>) -> Self {
        Self {
            capture_id: capture_id.into(),
            started_at: Utc::now(),
        }
    }
}

/// What a capture produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSummary {
    pub frame_count: u64,
    /// Time spent actually capturing, pauses excluded.
    pub duration: Duration,
}

#[async_trait]
pub trait CaptureService: Send + Sync {
    async fn start(&self, options: &CaptureOptions) -> anyhow::Result<CaptureHandle>;

    async fn stop(&self) -> anyhow::Result<CaptureSummary>;

    async fn pause(&self) -> anyhow::Result<()>;

    async fn resume(&self) -> anyhow::Result<()>;
}

struct Running {
    handle: CaptureHandle,
    frames_per_second: u32,
    started: Instant,
    paused_since: Option<Instant>,
    paused_total: Duration,
}

impl Running {
    fn active(&self, now: Instant) -> Duration {
        let open_pause = self
            .paused_since
            .map(|since| now.saturating_duration_since(since))
            .unwrap_or_default();
        now.saturating_duration_since(self.started)
            .saturating_sub(self.paused_total)
            .saturating_sub(open_pause)
    }
}

#[derive(Default)]
struct SimState {
    running: Option<Running>,
    next_id: u64,
    start_calls: u32,
    stop_calls: u32,
}

/// In-process capture that counts frames against the tokio clock.
///
/// Failures can be injected per call kind; each injected failure is consumed by one
/// call. `latency` is applied before every call does its work.
#[derive(Default)]
pub struct SimulatedCapture {
    state: Mutex<SimState>,
    latency: Duration,
    failing_starts: AtomicU32,
    failing_stops: AtomicU32,
    failing_controls: AtomicU32,
}

impl SimulatedCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail the next `count` starts.
    pub fn failing_starts(self, count: u32) -> Self {
        self.failing_starts.store(count, Ordering::SeqCst);
        self
    }

    /// Fail the next `count` stops.
    pub fn failing_stops(self, count: u32) -> Self {
        self.failing_stops.store(count, Ordering::SeqCst);
        self
    }

    /// Fail the next `count` pauses or resumes.
    pub fn failing_controls(self, count: u32) -> Self {
        self.failing_controls.store(count, Ordering::SeqCst);
        self
    }

    pub fn start_calls(&self) -> u32 {
        self.lock_state().start_calls
    }

    pub fn stop_calls(&self) -> u32 {
        self.lock_state().stop_calls
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().running.is_some()
    }

    fn lock_state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    /// Consume one injected failure, if any are left.
    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl CaptureService for SimulatedCapture {
    async fn start(&self, options: &CaptureOptions) -> anyhow::Result<CaptureHandle> {
        self.lock_state().start_calls += 1;
        self.delay().await;

        if Self::take_failure(&self.failing_starts) {
            anyhow::bail!("capture device unavailable");
        }

        let mut state = self.lock_state();
        if state.running.is_some() {
            anyhow::bail!("capture already running");
        }

        state.next_id += 1;
        let handle = CaptureHandle::new(format!("sim-{}", state.next_id));
        state.running = Some(Running {
            handle: handle.clone(),
            frames_per_second: options.frames_per_second,
            started: Instant::now(),
            paused_since: None,
            paused_total: Duration::ZERO,
        });
        debug!(capture_id = %handle.capture_id, label = ?options.label, "simulated capture started");
        Ok(handle)
    }

    async fn stop(&self) -> anyhow::Result<CaptureSummary> {
        self.lock_state().stop_calls += 1;
        self.delay().await;

        if Self::take_failure(&self.failing_stops) {
            anyhow::bail!("encoder failed to flush");
        }

        let mut state = self.lock_state();
        let running = state
            .running
            .take()
            .ok_or_else(|| anyhow::anyhow!("capture not running"))?;

        let duration = running.active(Instant::now());
        let frame_count =
            u64::try_from(duration.as_millis() * u128::from(running.frames_per_second) / 1000)
                .unwrap_or(u64::MAX);
        debug!(
            capture_id = %running.handle.capture_id,
            frame_count,
            duration_ms = duration.as_millis() as u64,
            "simulated capture stopped"
        );
        Ok(CaptureSummary {
            frame_count,
            duration,
        })
    }

    async fn pause(&self) -> anyhow::Result<()> {
        self.delay().await;
        if Self::take_failure(&self.failing_controls) {
            anyhow::bail!("capture refused to pause");
        }

        let mut state = self.lock_state();
        let running = state
            .running
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("capture not running"))?;
        if running.paused_since.is_none() {
            running.paused_since = Some(Instant::now());
        }
        Ok(())
    }

    async fn resume(&self) -> anyhow::Result<()> {
        self.delay().await;
        if Self::take_failure(&self.failing_controls) {
            anyhow::bail!("capture refused to resume");
        }

        let mut state = self.lock_state();
        let running = state
            .running
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("capture not running"))?;
        if let Some(since) = running.paused_since.take() {
            running.paused_total += Instant::now().saturating_duration_since(since);
        }
        Ok(())
    }
}
