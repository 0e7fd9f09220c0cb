//! Max-duration auto-stop and shutdown, on a paused tokio clock.

use reel::{
    CaptureOptions, ControllerState, EndReason, EventLog, MemoryStore, MetadataStore,
    SessionController, SessionError, SessionEvent, SessionRecord, SimulatedCapture,
};
use reelconf::ReelConfig;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    controller: Arc<SessionController>,
    store: Arc<MemoryStore>,
    events: Arc<EventLog>,
}

fn harness_with(config: ReelConfig, capture: SimulatedCapture) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let events = Arc::new(EventLog::new());
    let controller = SessionController::builder(config, Arc::new(capture))
        .store(store.clone())
        .observer(events.clone())
        .build()
        .unwrap();
    Harness {
        controller,
        store,
        events,
    }
}

fn harness() -> Harness {
    harness_with(ReelConfig::default(), SimulatedCapture::new())
}

fn stopped_reasons(events: &EventLog) -> Vec<EndReason> {
    events
        .events()
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::SessionStopped { reason, .. } => Some(reason),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn session_stops_itself_at_max_duration() {
    let h = harness();
    h.controller.initialize().await.unwrap();
    let id = h
        .controller
        .start(CaptureOptions::default().with_max_duration(Duration::from_secs(2)))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(h.controller.state(), ControllerState::Ready);
    assert!(h.controller.active_session().is_none());

    let records = h.store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, id);
    assert_eq!(records[0].end_reason, EndReason::MaxDuration);
    assert_eq!(records[0].max_duration_secs, Some(2));
    let active = records[0].active_ms;
    assert!((1990..=2010).contains(&active), "active_ms = {active}");
    // 30 fps for two seconds of tokio time.
    let frames = records[0].frame_count.unwrap();
    assert!((55..=62).contains(&frames), "frames = {frames}");

    assert_eq!(stopped_reasons(&h.events), vec![EndReason::MaxDuration]);
}

#[tokio::test(start_paused = true)]
async fn configured_max_duration_applies_by_default() {
    let mut config = ReelConfig::default();
    config.session.max_duration_secs = 5;
    let h = harness_with(config, SimulatedCapture::new());

    h.controller.initialize().await.unwrap();
    h.controller.start(CaptureOptions::default()).await.unwrap();

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(h.controller.state(), ControllerState::Recording);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.controller.state(), ControllerState::Ready);
    assert_eq!(stopped_reasons(&h.events), vec![EndReason::MaxDuration]);
}

#[tokio::test(start_paused = true)]
async fn stopping_early_disarms_the_deadline() {
    let h = harness();
    h.controller.initialize().await.unwrap();
    h.controller
        .start(CaptureOptions::default().with_max_duration(Duration::from_secs(2)))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    h.controller.stop().await.unwrap();

    // A second session must not be hit by the first one's deadline.
    let second = h.controller.start(CaptureOptions::default()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(h.controller.state(), ControllerState::Recording);
    assert_eq!(h.controller.active_session(), Some(second));
    assert_eq!(stopped_reasons(&h.events), vec![EndReason::Requested]);
}

#[tokio::test(start_paused = true)]
async fn max_duration_during_pause_still_stops() {
    let h = harness();
    h.controller.initialize().await.unwrap();
    h.controller
        .start(CaptureOptions::default().with_max_duration(Duration::from_secs(2)))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    h.controller.pause().await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(h.controller.state(), ControllerState::Ready);
    let records = h.store.records();
    assert_eq!(records[0].end_reason, EndReason::MaxDuration);
    assert_eq!(records[0].pause_intervals.len(), 1);
    assert!(records[0].pause_intervals[0].end.is_some());
}

#[tokio::test(start_paused = true)]
async fn shutdown_force_stops_the_active_session() {
    let h = harness();
    h.controller.initialize().await.unwrap();
    let id = h.controller.start(CaptureOptions::default()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    h.controller.shutdown().await.unwrap();

    assert_eq!(h.controller.state(), ControllerState::Idle);
    assert!(h.controller.active_session().is_none());
    let records = h.store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, id);
    assert_eq!(records[0].end_reason, EndReason::Shutdown);
    assert!(records[0].frame_count.is_some());

    // Shutdown again is harmless, and the controller can be brought back up.
    h.controller.shutdown().await.unwrap();
    h.controller.initialize().await.unwrap();
    h.controller.start(CaptureOptions::default()).await.unwrap();
    assert_eq!(h.controller.state(), ControllerState::Recording);
}

#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_a_slow_start() {
    let mut config = ReelConfig::default();
    config.session.start_timeout_ms = 20_000;
    let h = harness_with(
        config,
        SimulatedCapture::new().with_latency(Duration::from_secs(10)),
    );
    h.controller.initialize().await.unwrap();

    let controller = h.controller.clone();
    let start = tokio::spawn(async move { controller.start(CaptureOptions::default()).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.controller.lock_stats().acquired >= 2);

    let began = tokio::time::Instant::now();
    h.controller.shutdown().await.unwrap();
    assert!(began.elapsed() < Duration::from_secs(1));

    let err = start.await.unwrap().unwrap_err();
    assert!(err.is_cancelled(), "{err:?}");
    assert_eq!(h.controller.state(), ControllerState::Idle);
    assert!(h.store.records().is_empty());
}

#[tokio::test(start_paused = true)]
async fn start_latency_does_not_count_against_max_duration() {
    let h = harness_with(
        ReelConfig::default(),
        SimulatedCapture::new().with_latency(Duration::from_millis(1500)),
    );
    h.controller.initialize().await.unwrap();

    let id = h
        .controller
        .start(CaptureOptions::default().with_max_duration(Duration::from_secs(1)))
        .await
        .unwrap();
    assert_eq!(h.controller.state(), ControllerState::Recording);
    assert_eq!(h.controller.active_session(), Some(id.clone()));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(h.controller.state(), ControllerState::Recording);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.controller.state(), ControllerState::Ready);
    let records = h.store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, id);
    assert_eq!(records[0].end_reason, EndReason::MaxDuration);
}

/// Never finishes preparing.
struct StalledStore;

#[async_trait::async_trait]
impl MetadataStore for StalledStore {
    async fn prepare(&self) -> anyhow::Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }

    async fn write(&self, _record: &SessionRecord) -> anyhow::Result<()> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_a_slow_initialize() {
    let controller = SessionController::builder(
        ReelConfig::default(),
        Arc::new(SimulatedCapture::new()),
    )
    .store(Arc::new(StalledStore))
    .build()
    .unwrap();

    let init = tokio::spawn({
        let controller = controller.clone();
        async move { controller.initialize().await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(controller.state(), ControllerState::Initializing);

    let began = tokio::time::Instant::now();
    controller.shutdown().await.unwrap();
    assert!(began.elapsed() < Duration::from_secs(1));

    match init.await.unwrap().unwrap_err() {
        SessionError::Cancelled { cancelled, .. } => {
            assert_eq!(cancelled.origin, turnstile::CancelOrigin::Parent)
        }
        other => panic!("expected a cancellation, got {other:?}"),
    }
    assert_eq!(controller.state(), ControllerState::Idle);
}
