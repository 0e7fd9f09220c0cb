//! Session controller - the state machine that drives one capture service.
//!
//! Every operation that changes state or the active session runs inside the
//! controller's [`FairLock`], so operations are applied one at a time in arrival
//! order. The `std::sync::Mutex` around the fields only protects memory and is never
//! held across an await; that is what lets [`SessionController::info`] read a
//! consistent snapshot without queueing behind a slow stop.
//!
//! Signals form a tree:
//!
//! ```text
//! controller root ──┬── metadata.prepare / capture.start
//!                   ├── session (max-duration deadline, armed once capture runs)
//!                   │      └── capture.pause / capture.resume
//!                   └── capture.stop
//! ```
//!
//! Cancelling the root (shutdown) therefore aborts whatever is in flight.

use reelconf::{ReelConfig, RetryStrategy};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use turnstile::{
    Backoff, BoundedOperation, CancellationSignal, FairLock, LockStats, SignalWatcher,
};

use crate::capture::{CaptureOptions, CaptureService};
use crate::error::SessionError;
use crate::observer::{SessionEvent, SessionObserver};
use crate::session::{EndReason, Session, SessionId, SessionInfo, SessionRecord, StopResult};
use crate::state::ControllerState;
use crate::store::{JsonFileStore, MetadataStore};

struct ControllerInner {
    state: ControllerState,
    active: Option<Session>,
    /// Shared so shutdown can cancel it without holding the mutex.
    root: Arc<CancellationSignal>,
    completed_sessions: u64,
}

fn new_root() -> Arc<CancellationSignal> {
    Arc::new(CancellationSignal::builder().label("controller").build())
}

#[derive(Debug, Clone, Copy)]
enum Control {
    Pause,
    Resume,
}

/// Consistent snapshot of the controller.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerInfo {
    pub state: ControllerState,
    pub session: Option<SessionInfo>,
    pub completed_sessions: u64,
    /// `FairLock::summary` of the session lock.
    pub lock: serde_json::Value,
}

pub struct SessionControllerBuilder {
    config: ReelConfig,
    capture: Arc<dyn CaptureService>,
    store: Option<Arc<dyn MetadataStore>>,
    observers: Vec<Arc<dyn SessionObserver>>,
}

impl SessionControllerBuilder {
    /// Defaults to a [`JsonFileStore`] in `paths.metadata_dir`.
    pub fn store(mut self, store: Arc<dyn MetadataStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Validate the config and build the controller in `Idle`.
    pub fn build(self) -> Result<Arc<SessionController>, SessionError> {
        let SessionControllerBuilder {
            config,
            capture,
            store,
            observers,
        } = self;

        config.validate()?;

        let store = store.unwrap_or_else(|| {
            Arc::new(JsonFileStore::new(config.paths.metadata_dir.clone())) as Arc<dyn MetadataStore>
        });
        let lock = FairLock::new("session", config.lock.default_timeout());

        Ok(Arc::new_cyclic(|this| SessionController {
            config,
            lock,
            capture,
            store,
            observers,
            inner: Mutex::new(ControllerInner {
                state: ControllerState::Idle,
                active: None,
                root: new_root(),
                completed_sessions: 0,
            }),
            this: this.clone(),
        }))
    }
}

pub struct SessionController {
    config: ReelConfig,
    lock: FairLock,
    capture: Arc<dyn CaptureService>,
    store: Arc<dyn MetadataStore>,
    observers: Vec<Arc<dyn SessionObserver>>,
    inner: Mutex<ControllerInner>,
    /// For auto-stop tasks spawned from signal callbacks.
    this: Weak<SessionController>,
}

impl SessionController {
    pub fn builder(config: ReelConfig, capture: Arc<dyn CaptureService>) -> SessionControllerBuilder {
        SessionControllerBuilder {
            config,
            capture,
            store: None,
            observers: Vec::new(),
        }
    }

    pub fn config(&self) -> &ReelConfig {
        &self.config
    }

    pub fn state(&self) -> ControllerState {
        self.lock_inner().state
    }

    pub fn active_session(&self) -> Option<SessionId> {
        self.lock_inner().active.as_ref().map(|s| s.id.clone())
    }

    pub fn lock_stats(&self) -> LockStats {
        self.lock.stats()
    }

    /// Snapshot of state, active session and lock occupancy. Never waits on the
    /// session lock.
    pub fn info(&self) -> ControllerInfo {
        let (state, session, completed_sessions) = {
            let inner = self.lock_inner();
            (
                inner.state,
                inner.active.as_ref().map(Session::info),
                inner.completed_sessions,
            )
        };
        ControllerInfo {
            state,
            session,
            completed_sessions,
            lock: self.lock.summary(),
        }
    }

    /// `Idle -> Initializing -> Ready`. A no-op once initialized; rejected from
    /// `Error` (shut down first).
    #[tracing::instrument(skip(self))]
    pub async fn initialize(&self) -> Result<(), SessionError> {
        self.lock
            .with_lock("initialize", None, || self.initialize_locked())
            .await
    }

    /// Start a new session. Requires `Ready`.
    #[tracing::instrument(skip(self, options))]
    pub async fn start(&self, options: CaptureOptions) -> Result<SessionId, SessionError> {
        self.lock
            .with_lock("start", None, || self.start_locked(options))
            .await
    }

    /// Stop the active session, persist its record and return to `Ready`.
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self) -> Result<StopResult, SessionError> {
        self.lock
            .with_lock("stop", None, || {
                self.stop_locked("stop", EndReason::Requested, None)
            })
            .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn pause(&self) -> Result<(), SessionError> {
        self.lock
            .with_lock("pause", None, || self.control_locked(Control::Pause))
            .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn resume(&self) -> Result<(), SessionError> {
        self.lock
            .with_lock("resume", None, || self.control_locked(Control::Resume))
            .await
    }

    /// Cancel everything in flight, force-stop the active session and go `Idle`.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        // Before queueing, so a holder stuck in collaborator I/O is interrupted.
        // Callbacks run synchronously, so cancel outside the state mutex.
        let root = self.lock_inner().root.clone();
        let first = root.cancel("controller shutdown");
        debug!(first, "controller root cancelled");

        self.lock
            .with_lock(
                "shutdown",
                Some(self.config.session.shutdown_timeout()),
                || self.shutdown_locked(),
            )
            .await
    }

    async fn initialize_locked(&self) -> Result<(), SessionError> {
        let state = self.state();
        if state.is_initialized() {
            debug!(state = %state, "controller already initialized");
            return Ok(());
        }

        let root = self.transition_with("initialize", ControllerState::Initializing, |inner| {
            if inner.root.is_cancelled() {
                inner.root = new_root();
            }
            inner.root.watcher()
        })?;

        let store = self.store.clone();
        let prepared = self
            .operation(
                "metadata.prepare",
                self.config.session.persist_timeout(),
                Some(&root),
            )
            .execute(|_| {
                let store = store.clone();
                async move { store.prepare().await }
            })
            .await;

        match prepared {
            Ok(()) => {
                self.transition("initialize", ControllerState::Ready)?;
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "controller failed to initialize");
                self.transition("initialize", ControllerState::Error)?;
                Err(err.into())
            }
        }
    }

    async fn start_locked(&self, options: CaptureOptions) -> Result<SessionId, SessionError> {
        let state = self.state();
        if state != ControllerState::Ready {
            return Err(SessionError::InvalidStateTransition {
                operation: "start",
                state,
            });
        }

        let session_id = SessionId::generate();
        let max_duration = options
            .max_duration
            .or_else(|| self.config.session.max_duration());

        // The session signal, and with it the max-duration clock, only exists once
        // capture is running; until then the call answers to the root alone.
        let root = self.root_watcher();
        let capture = self.capture.clone();
        let started = self
            .operation(
                "capture.start",
                self.config.session.start_timeout(),
                Some(&root),
            )
            .execute(|_| {
                let capture = capture.clone();
                let options = options.clone();
                async move { capture.start(&options).await }
            })
            .await;

        match started {
            Ok(handle) => {
                let signal = CancellationSignal::builder()
                    .label(format!("session {}", session_id))
                    .parent(&root)
                    .timeout_opt(max_duration)
                    .build();
                self.arm_auto_stop(&signal, &session_id);

                let capture_id = handle.capture_id.clone();
                let session = Session::new(session_id.clone(), signal, handle, max_duration);
                self.transition_with("start", ControllerState::Recording, move |inner| {
                    inner.active = Some(session);
                })?;
                info!(
                    session_id = %session_id,
                    capture_id = %capture_id,
                    max_duration_secs = max_duration.map(|d| d.as_secs()),
                    "session started"
                );
                self.emit(SessionEvent::SessionStarted {
                    session_id: session_id.clone(),
                });
                Ok(session_id)
            }
            Err(err) => {
                error!(session_id = %session_id, error = %err, "session failed to start");
                self.transition("start", ControllerState::Error)?;
                Err(err.into())
            }
        }
    }

    /// Stop the active session. With `expected`, only if it is still that session.
    async fn stop_locked(
        &self,
        operation: &'static str,
        reason: EndReason,
        expected: Option<&SessionId>,
    ) -> Result<StopResult, SessionError> {
        let root = {
            let inner = self.lock_inner();
            match (&inner.active, expected) {
                (None, _) => return Err(SessionError::NotActive { operation }),
                (Some(active), Some(expected)) if &active.id != expected => {
                    return Err(SessionError::NotActive { operation })
                }
                _ => {}
            }
            inner.root.watcher()
        };

        let mut session = self
            .transition_with(operation, ControllerState::Analyzing, |inner| {
                inner.active.take()
            })?
            .ok_or(SessionError::NotActive { operation })?;
        session.end_pause();

        // During shutdown the root is already cancelled; stop anyway.
        let parent = (!root.is_cancelled()).then_some(root);
        let capture = self.capture.clone();
        let stopped = self
            .operation(
                "capture.stop",
                self.config.session.stop_timeout(),
                parent.as_ref(),
            )
            .execute(|_| {
                let capture = capture.clone();
                async move { capture.stop().await }
            })
            .await;

        session.end();
        session.signal.cancel(format!("session ended ({})", reason));

        let (summary, failure) = match stopped {
            Ok(summary) => (Some(summary), None),
            Err(err) => (None, Some(SessionError::from(err))),
        };
        let record = session.record(
            reason,
            summary.as_ref(),
            failure.as_ref().map(|e| e.to_string()),
        );
        let persisted = self.persist(&record).await;

        let next = if failure.is_some() {
            ControllerState::Error
        } else {
            ControllerState::Ready
        };
        self.transition_with(operation, next, |inner| inner.completed_sessions += 1)?;
        self.emit(SessionEvent::SessionStopped {
            session_id: record.id.clone(),
            reason,
            frame_count: record.frame_count,
        });

        match failure {
            Some(err) => {
                error!(session_id = %record.id, reason = %reason, error = %err, "session ended but capture stop failed");
                Err(err)
            }
            None => {
                info!(
                    session_id = %record.id,
                    reason = %reason,
                    frame_count = record.frame_count,
                    active_ms = record.active_ms,
                    paused_ms = record.paused_ms,
                    persisted,
                    "session stopped"
                );
                Ok(StopResult::from_record(&record, persisted))
            }
        }
    }

    async fn control_locked(&self, control: Control) -> Result<(), SessionError> {
        let (operation, from, to, call) = match control {
            Control::Pause => (
                "pause",
                ControllerState::Recording,
                ControllerState::Paused,
                "capture.pause",
            ),
            Control::Resume => (
                "resume",
                ControllerState::Paused,
                ControllerState::Recording,
                "capture.resume",
            ),
        };

        let (session_id, signal) = {
            let inner = self.lock_inner();
            let Some(active) = inner.active.as_ref() else {
                return Err(SessionError::NotActive { operation });
            };
            if inner.state != from {
                return Err(SessionError::InvalidStateTransition {
                    operation,
                    state: inner.state,
                });
            }
            (active.id.clone(), active.signal.watcher())
        };

        let capture = self.capture.clone();
        self.operation(call, self.config.session.control_timeout(), Some(&signal))
            .execute(|_| {
                let capture = capture.clone();
                async move {
                    match control {
                        Control::Pause => capture.pause().await,
                        Control::Resume => capture.resume().await,
                    }
                }
            })
            .await?;

        self.transition_with(operation, to, |inner| {
            if let Some(session) = inner.active.as_mut() {
                match control {
                    Control::Pause => session.begin_pause(),
                    Control::Resume => session.end_pause(),
                }
            }
        })?;
        info!(session_id = %session_id, "session {}d", operation);
        Ok(())
    }

    async fn shutdown_locked(&self) -> Result<(), SessionError> {
        let state = self.state();
        if state == ControllerState::Idle {
            return Ok(());
        }

        if state.has_session() {
            if let Err(err) = self
                .stop_locked("shutdown", EndReason::Shutdown, None)
                .await
            {
                warn!(error = %err, "force-stop during shutdown failed");
            }
        }

        self.transition_with("shutdown", ControllerState::Idle, |inner| {
            inner.active.take()
        })?;
        info!("controller shut down");
        Ok(())
    }

    async fn auto_stop(self: Arc<Self>, session_id: SessionId) {
        info!(session_id = %session_id, "session reached its max duration");
        let result = self
            .lock
            .with_lock("auto-stop", None, || {
                self.stop_locked("auto-stop", EndReason::MaxDuration, Some(&session_id))
            })
            .await;

        match result {
            Ok(stopped) => info!(
                session_id = %stopped.session_id,
                frame_count = stopped.frame_count,
                "session auto-stopped"
            ),
            Err(SessionError::NotActive { .. }) => {
                debug!(session_id = %session_id, "session ended before auto-stop ran")
            }
            Err(err) => warn!(session_id = %session_id, error = %err, "auto-stop failed"),
        }
    }

    /// Stop the session from a background task when its deadline fires.
    fn arm_auto_stop(&self, signal: &SignalWatcher, session_id: &SessionId) {
        let controller = self.this.clone();
        let session_id = session_id.clone();
        signal.register(move |cancellation| {
            if !cancellation.is_timeout() {
                return;
            }
            let Some(controller) = controller.upgrade() else {
                return;
            };
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(controller.auto_stop(session_id));
                }
                Err(_) => warn!(
                    session_id = %session_id,
                    "max duration reached outside a runtime, session left running"
                ),
            }
        });
    }

    /// Best effort: failures are logged and reported, never returned.
    async fn persist(&self, record: &SessionRecord) -> bool {
        let store = self.store.clone();
        let written = self
            .operation(
                "metadata.write",
                self.config.session.persist_timeout(),
                None,
            )
            .execute(|_| {
                let store = store.clone();
                let record = record.clone();
                async move { store.write(&record).await }
            })
            .await;

        match written {
            Ok(()) => true,
            Err(err) => {
                warn!(session_id = %record.id, error = %err, "failed to persist session metadata");
                self.emit(SessionEvent::PersistFailed {
                    session_id: record.id.clone(),
                    error: err.to_string(),
                });
                false
            }
        }
    }

    fn root_watcher(&self) -> SignalWatcher {
        self.lock_inner().root.watcher()
    }

    fn operation(
        &self,
        name: &str,
        timeout: Duration,
        parent: Option<&SignalWatcher>,
    ) -> BoundedOperation {
        let retry = &self.config.retry;
        let backoff = match retry.strategy {
            RetryStrategy::Exponential => Backoff::exponential(retry.base(), retry.max()),
            RetryStrategy::Linear => Backoff::linear(retry.base(), retry.increment(), retry.max()),
        };
        BoundedOperation::new(name)
            .with_timeout(timeout)
            .with_retries(retry.max_retries)
            .with_backoff(backoff)
            .with_signal_opt(parent)
    }

    fn transition(&self, operation: &'static str, to: ControllerState) -> Result<(), SessionError> {
        self.transition_with(operation, to, |_| ())
    }

    /// Check the move against the transition table, apply `mutate` and the new state
    /// together, then notify observers outside the mutex.
    fn transition_with<R>(
        &self,
        operation: &'static str,
        to: ControllerState,
        mutate: impl FnOnce(&mut ControllerInner) -> R,
    ) -> Result<R, SessionError> {
        let (from, out) = {
            let mut inner = self.lock_inner();
            let from = inner.state;
            if !from.can_transition_to(to) {
                return Err(SessionError::InvalidStateTransition {
                    operation,
                    state: from,
                });
            }
            let out = mutate(&mut inner);
            inner.state = to;
            (from, out)
        };

        info!(operation, from = %from, to = %to, "controller state changed");
        self.emit(SessionEvent::StateChanged { from, to });
        Ok(out)
    }

    fn emit(&self, event: SessionEvent) {
        for observer in &self.observers {
            observer.on_event(&event);
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, ControllerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock_inner();
        f.debug_struct("SessionController")
            .field("state", &inner.state)
            .field("active", &inner.active)
            .field("lock", &self.lock)
            .finish()
    }
}
