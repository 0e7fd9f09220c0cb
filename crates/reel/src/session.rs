//! Session domain types.
//!
//! [`Session`] is the live, in-memory form owned by the controller. [`SessionRecord`]
//! is what gets persisted once it ends, and [`StopResult`] is what `stop` hands back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use turnstile::CancellationSignal;

use crate::capture::{CaptureHandle, CaptureSummary};

/// Unique identifier for a recording session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Generate a new unique session ID
    pub fn generate() -> Self {
        let random = uuid::Uuid::new_v4();
        Self(format!(
            "session-{}-{}",
            Utc::now().timestamp_millis(),
            random.as_simple()
        ))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One pause, in wall-clock time. `end` is `None` while the session is still paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseInterval {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// `stop` was called.
    Requested,
    /// The max-duration deadline fired.
    MaxDuration,
    /// The controller shut down with the session still running.
    Shutdown,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Requested => "requested",
            EndReason::MaxDuration => "max_duration",
            EndReason::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// A live session.
///
/// Timestamps are wall-clock for the record; durations are measured on the tokio
/// clock, the same clock that drives capture and the max-duration deadline.
pub struct Session {
    pub id: SessionId,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub pause_intervals: Vec<PauseInterval>,
    pub max_duration: Option<Duration>,
    /// Cancelled when the session ends; parent of every call made for the session.
    pub signal: CancellationSignal,
    pub capture: CaptureHandle,
    started: Instant,
    ended: Option<Instant>,
    paused_since: Option<Instant>,
    paused_total: Duration,
}

impl Session {
    pub fn new(
        id: SessionId,
        signal: CancellationSignal,
        capture: CaptureHandle,
        max_duration: Option<Duration>,
    ) -> Self {
        Self {
            id,
            started_at: Utc::now(),
            ended_at: None,
            pause_intervals: Vec::new(),
            max_duration,
            signal,
            capture,
            started: Instant::now(),
            ended: None,
            paused_since: None,
            paused_total: Duration::ZERO,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused_since.is_some()
    }

    pub fn is_ended(&self) -> bool {
        self.ended.is_some()
    }

    pub fn begin_pause(&mut self) {
        if self.is_paused() || self.is_ended() {
            return;
        }
        self.paused_since = Some(Instant::now());
        self.pause_intervals.push(PauseInterval {
            start: Utc::now(),
            end: None,
        });
    }

    /// Close the open pause, if there is one.
    pub fn end_pause(&mut self) {
        let Some(since) = self.paused_since.take() else {
            return;
        };
        self.paused_total += Instant::now().saturating_duration_since(since);
        if let Some(open) = self.pause_intervals.last_mut() {
            open.end = Some(Utc::now());
        }
    }

    /// Close any open pause and stamp the end. Later calls are no-ops.
    pub fn end(&mut self) {
        if self.is_ended() {
            return;
        }
        self.end_pause();
        self.ended = Some(Instant::now());
        self.ended_at = Some(Utc::now());
    }

    fn until(&self) -> Instant {
        self.ended.unwrap_or_else(Instant::now)
    }

    /// Closed pauses plus the open one, if any, up to now.
    pub fn paused_duration(&self) -> Duration {
        let open = self
            .paused_since
            .map(|since| self.until().saturating_duration_since(since))
            .unwrap_or_default();
        self.paused_total + open
    }

    /// Time since start (or until end) minus time spent paused.
    pub fn active_duration(&self) -> Duration {
        self.until()
            .saturating_duration_since(self.started)
            .saturating_sub(self.paused_duration())
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            started_at: self.started_at,
            paused: self.is_paused(),
            pause_count: self.pause_intervals.len(),
            paused_ms: millis(self.paused_duration()),
            active_ms: millis(self.active_duration()),
            deadline: self.signal.deadline(),
            capture_id: self.capture.capture_id.clone(),
        }
    }

    /// Persisted form. Call [`Session::end`] first.
    pub fn record(
        &self,
        reason: EndReason,
        summary: Option<&CaptureSummary>,
        error: Option<String>,
    ) -> SessionRecord {
        SessionRecord {
            id: self.id.clone(),
            capture_id: self.capture.capture_id.clone(),
            started_at: self.started_at,
            ended_at: self.ended_at.unwrap_or_else(Utc::now),
            pause_intervals: self.pause_intervals.clone(),
            paused_ms: millis(self.paused_duration()),
            active_ms: millis(self.active_duration()),
            frame_count: summary.map(|s| s.frame_count),
            capture_duration_ms: summary.map(|s| millis(s.duration)),
            max_duration_secs: self.max_duration.map(|d| d.as_secs()),
            end_reason: reason,
            error,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("started_at", &self.started_at)
            .field("ended_at", &self.ended_at)
            .field("pause_intervals", &self.pause_intervals)
            .field("cancelled", &self.signal.is_cancelled())
            .finish()
    }
}

/// Read-only view of the active session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub started_at: DateTime<Utc>,
    pub paused: bool,
    pub pause_count: usize,
    pub paused_ms: u64,
    pub active_ms: u64,
    /// When the session will be stopped automatically.
    pub deadline: Option<DateTime<Utc>>,
    pub capture_id: String,
}

/// What is written to the metadata store when a session ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub capture_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub pause_intervals: Vec<PauseInterval>,
    pub paused_ms: u64,
    pub active_ms: u64,
    /// Missing when capture stop failed.
    pub frame_count: Option<u64>,
    pub capture_duration_ms: Option<u64>,
    pub max_duration_secs: Option<u64>,
    pub end_reason: EndReason,
    pub error: Option<String>,
}

/// Returned by a successful stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopResult {
    pub session_id: SessionId,
    pub end_reason: EndReason,
    pub frame_count: u64,
    pub capture_duration_ms: u64,
    pub paused_ms: u64,
    pub active_ms: u64,
    pub pause_count: usize,
    /// False if the metadata write failed; the session still ended.
    pub persisted: bool,
}

impl StopResult {
    pub fn from_record(record: &SessionRecord, persisted: bool) -> Self {
        Self {
            session_id: record.id.clone(),
            end_reason: record.end_reason,
            frame_count: record.frame_count.unwrap_or(0),
            capture_duration_ms: record.capture_duration_ms.unwrap_or(0),
            paused_ms: record.paused_ms,
            active_ms: record.active_ms,
            pause_count: record.pause_intervals.len(),
            persisted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(
            SessionId::new("session-test"),
            CancellationSignal::new(),
            CaptureHandle::new("cap-1"),
            None,
        )
    }

    async fn advance(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    /// The paused clock rounds timers up to the next millisecond.
    fn assert_close(actual: Duration, expected: Duration) {
        let diff = actual.max(expected) - actual.min(expected);
        assert!(diff <= Duration::from_millis(2), "{actual:?} vs {expected:?}");
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("session-"));
    }

    #[tokio::test(start_paused = true)]
    async fn paused_time_sums_closed_and_open_intervals() {
        let mut session = session();

        advance(10).await;
        session.begin_pause();
        advance(5).await;
        session.end_pause();
        advance(5).await;
        session.begin_pause();
        advance(3).await;
        assert!(session.is_paused());

        assert_close(session.paused_duration(), Duration::from_secs(8));
        assert_close(session.active_duration(), Duration::from_secs(15));
        assert!((14_998..=15_002).contains(&session.info().active_ms));
    }

    #[tokio::test(start_paused = true)]
    async fn double_pause_does_not_open_a_second_interval() {
        let mut session = session();
        session.begin_pause();
        advance(1).await;
        session.begin_pause();
        assert_eq!(session.pause_intervals.len(), 1);

        session.end_pause();
        advance(1).await;
        session.end_pause();
        assert_close(session.paused_duration(), Duration::from_secs(1));
        assert!(session.pause_intervals[0].end.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn record_freezes_durations_at_end() {
        let mut session = session();
        advance(1).await;
        session.begin_pause();
        advance(2).await;
        session.end_pause();
        advance(7).await;
        session.end();
        advance(30).await;

        let summary = CaptureSummary {
            frame_count: 240,
            duration: Duration::from_secs(8),
        };
        let record = session.record(EndReason::Requested, Some(&summary), None);

        assert!((1_998..=2_002).contains(&record.paused_ms));
        assert!((7_998..=8_002).contains(&record.active_ms));
        assert_eq!(record.frame_count, Some(240));

        let result = StopResult::from_record(&record, true);
        assert_eq!(result.capture_duration_ms, 8_000);
        assert_eq!(result.pause_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ending_while_paused_closes_the_pause() {
        let mut session = session();
        advance(1).await;
        session.begin_pause();
        advance(4).await;
        session.end();

        assert!(!session.is_paused());
        assert!(session.pause_intervals[0].end.is_some());
        assert_close(session.paused_duration(), Duration::from_secs(4));
        assert_close(session.active_duration(), Duration::from_secs(1));

        session.begin_pause();
        assert_eq!(session.pause_intervals.len(), 1);
    }

    #[tokio::test]
    async fn record_serializes_end_reason_snake_case() {
        let mut session = session();
        session.end();
        let record = session.record(EndReason::MaxDuration, None, Some("encoder crashed".into()));

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["end_reason"], "max_duration");
        assert_eq!(json["frame_count"], serde_json::Value::Null);
        assert_eq!(json["error"], "encoder crashed");
    }
}
