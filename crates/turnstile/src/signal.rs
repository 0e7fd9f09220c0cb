//! Hierarchical cancellation signals.
//!
//! A [`CancellationSignal`] is owned by exactly one unit of work (a session, a single
//! bounded call). Only the owner can cancel it. Anyone else holds a cloneable
//! [`SignalWatcher`] and may read the state, register cleanup callbacks, or await
//! cancellation.
//!
//! Propagation runs parent → child only. A child holds a weak link to its parent, and
//! the parent holds a callback with a weak reference to the child, so neither keeps the
//! other alive. Cancellation runs every callback synchronously before `cancel` returns,
//! which means the whole subtree has observed it by then.
//!
//! ```text
//! session signal (timeout = max session duration)
//!    ├── capture.start call signal (timeout = 10s)
//!    └── capture.pause call signal (timeout = 5s)
//! ```

use chrono::{DateTime, Utc};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::{CancelOrigin, Cancelled};

type Callback = Box<dyn FnOnce(&Cancelled) + Send>;

struct SignalState {
    cancellation: Option<Cancelled>,
    callbacks: Vec<(u64, Callback)>,
    next_id: u64,
    timer: Option<JoinHandle<()>>,
    /// Our callbacks registered on parents / combined members.
    links: Vec<Registration>,
}

struct SignalInner {
    label: String,
    deadline: Option<DateTime<Utc>>,
    parent: Option<Weak<SignalInner>>,
    state: Mutex<SignalState>,
    notify: watch::Sender<bool>,
}

impl SignalInner {
    fn lock_state(&self) -> MutexGuard<'_, SignalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel_with(&self, reason: String, origin: CancelOrigin) -> bool {
        let (cancellation, callbacks, timer) = {
            let mut state = self.lock_state();
            if state.cancellation.is_some() {
                return false;
            }
            let cancellation = Cancelled::new(reason, origin);
            state.cancellation = Some(cancellation.clone());
            (
                cancellation,
                std::mem::take(&mut state.callbacks),
                state.timer.take(),
            )
        };

        // The timer task is the caller when origin is Timeout; it finishes on its own.
        if let Some(timer) = timer {
            if origin != CancelOrigin::Timeout {
                timer.abort();
            }
        }

        debug!(
            signal = %self.label,
            origin = %cancellation.origin,
            reason = %cancellation.reason,
            callbacks = callbacks.len(),
            "signal cancelled"
        );

        self.notify.send_replace(true);

        for (_, callback) in callbacks {
            invoke(&self.label, callback, &cancellation);
        }

        true
    }
}

impl Drop for SignalInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        for link in state.links.drain(..) {
            link.unregister();
        }
    }
}

/// Run one callback, trapping panics so the remaining callbacks still fire.
fn invoke(label: &str, callback: Callback, cancellation: &Cancelled) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(move || callback(cancellation))) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        error!(signal = %label, panic = %message, "cancellation callback panicked");
    }
}

/// Handle returned by [`SignalWatcher::register`].
///
/// Dropping it leaves the callback registered; call [`Registration::unregister`] to
/// remove it.
pub struct Registration {
    target: Weak<SignalInner>,
    id: Option<u64>,
}

impl Registration {
    fn noop() -> Self {
        Self {
            target: Weak::new(),
            id: None,
        }
    }

    /// Remove the callback if it has not fired yet.
    pub fn unregister(self) {
        if let (Some(inner), Some(id)) = (self.target.upgrade(), self.id) {
            let removed = {
                let mut state = inner.lock_state();
                state
                    .callbacks
                    .iter()
                    .position(|(cb_id, _)| *cb_id == id)
                    .map(|index| state.callbacks.remove(index))
            };
            // Captured state is dropped outside the lock.
            drop(removed);
        }
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration").field("id", &self.id).finish()
    }
}

/// Read/register view of a signal. Cheap to clone.
#[derive(Clone)]
pub struct SignalWatcher {
    inner: Arc<SignalInner>,
}

impl SignalWatcher {
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock_state().cancellation.is_some()
    }

    /// The recorded cancellation, if any.
    pub fn cancellation(&self) -> Option<Cancelled> {
        self.inner.lock_state().cancellation.clone()
    }

    pub fn reason(&self) -> Option<String> {
        self.cancellation().map(|c| c.reason)
    }

    pub fn cancelled_at(&self) -> Option<DateTime<Utc>> {
        self.cancellation().map(|c| c.at)
    }

    /// When the auto-cancel timer fires, if one was configured.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.inner.deadline
    }

    /// The parent signal, while it is still alive.
    pub fn parent(&self) -> Option<SignalWatcher> {
        self.inner
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| SignalWatcher { inner })
    }

    /// Number of callbacks still waiting to fire.
    pub fn pending_callbacks(&self) -> usize {
        self.inner.lock_state().callbacks.len()
    }

    /// Error with the recorded cancellation if the signal has fired.
    pub fn check(&self) -> Result<(), Cancelled> {
        match self.cancellation() {
            Some(cancellation) => Err(cancellation),
            None => Ok(()),
        }
    }

    /// Register a cleanup callback.
    ///
    /// On an already-cancelled signal the callback runs immediately, on this thread,
    /// and the returned registration is inert.
    pub fn register<F>(&self, callback: F) -> Registration
    where
        F: FnOnce(&Cancelled) + Send + 'static,
    {
        let mut state = self.inner.lock_state();
        if let Some(cancellation) = state.cancellation.clone() {
            drop(state);
            invoke(&self.inner.label, Box::new(callback), &cancellation);
            return Registration::noop();
        }

        let id = state.next_id;
        state.next_id += 1;
        state.callbacks.push((id, Box::new(callback)));

        Registration {
            target: Arc::downgrade(&self.inner),
            id: Some(id),
        }
    }

    /// Resolve once the signal is cancelled. Resolves immediately if it already is.
    pub async fn cancelled(&self) -> Cancelled {
        // Subscribe before checking so a cancel in between still wakes us.
        let mut rx = self.inner.notify.subscribe();
        loop {
            if let Some(cancellation) = self.cancellation() {
                return cancellation;
            }
            if rx.changed().await.is_err() {
                // Sender lives in `inner`, which we hold; this cannot happen.
                std::future::pending::<()>().await;
            }
        }
    }

    fn link(&self, registration: Registration) {
        self.inner.lock_state().links.push(registration);
    }
}

impl std::fmt::Debug for SignalWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalWatcher")
            .field("label", &self.inner.label)
            .field("cancellation", &self.cancellation())
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}

/// Builder for signals with a parent, a timeout, or both.
#[derive(Default)]
pub struct SignalBuilder<'a> {
    label: Option<String>,
    parent: Option<&'a SignalWatcher>,
    timeout: Option<Duration>,
}

impl<'a> SignalBuilder<'a> {
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn parent(mut self, parent: &'a SignalWatcher) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn parent_opt(mut self, parent: Option<&'a SignalWatcher>) -> Self {
        self.parent = parent;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn timeout_opt(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build the signal.
    ///
    /// # Panics
    ///
    /// With a timeout set, this must be called inside a tokio runtime (the timer is a
    /// spawned task).
    pub fn build(self) -> CancellationSignal {
        let (notify, _) = watch::channel(false);
        let deadline = self.timeout.and_then(|timeout| {
            chrono::Duration::from_std(timeout)
                .ok()
                .and_then(|delta| Utc::now().checked_add_signed(delta))
        });

        let inner = Arc::new(SignalInner {
            label: self.label.unwrap_or_else(|| "signal".to_string()),
            deadline,
            parent: self.parent.map(|p| Arc::downgrade(&p.inner)),
            state: Mutex::new(SignalState {
                cancellation: None,
                callbacks: Vec::new(),
                next_id: 0,
                timer: None,
                links: Vec::new(),
            }),
            notify,
        });
        let watcher = SignalWatcher { inner };

        if let Some(parent) = self.parent {
            let child = Arc::downgrade(&watcher.inner);
            let link = parent.register(move |cancellation| {
                if let Some(child) = child.upgrade() {
                    child.cancel_with(cancellation.reason.clone(), CancelOrigin::Parent);
                }
            });
            watcher.link(link);
        }

        if let Some(timeout) = self.timeout {
            let mut state = watcher.inner.lock_state();
            if state.cancellation.is_none() {
                let weak = Arc::downgrade(&watcher.inner);
                state.timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    if let Some(inner) = weak.upgrade() {
                        inner.cancel_with(
                            format!("timeout after {}ms", timeout.as_millis()),
                            CancelOrigin::Timeout,
                        );
                    }
                }));
            }
        }

        CancellationSignal { watcher }
    }
}

/// Owner handle of a cancellation signal.
///
/// Not `Clone`: the owner is the only one allowed to cancel. Hand out
/// [`SignalWatcher`]s (via [`CancellationSignal::watcher`] or `Deref`) to readers.
pub struct CancellationSignal {
    watcher: SignalWatcher,
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder<'a>() -> SignalBuilder<'a> {
        SignalBuilder::default()
    }

    /// A signal cancelled whenever `parent` is.
    pub fn child_of(parent: &SignalWatcher) -> Self {
        Self::builder().parent(parent).build()
    }

    /// A signal that cancels itself with `"timeout after {N}ms"` once `timeout` elapses.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::builder().timeout(timeout).build()
    }

    /// A signal cancelled as soon as any member cancels.
    ///
    /// The recorded origin is `CancelOrigin::Member(index)` of the first member to fire;
    /// the reason is that member's reason.
    pub fn any(members: &[&SignalWatcher]) -> Self {
        let combined = Self::builder().label("any").build();
        for (index, member) in members.iter().enumerate() {
            let target = Arc::downgrade(&combined.watcher.inner);
            let link = member.register(move |cancellation| {
                if let Some(target) = target.upgrade() {
                    target.cancel_with(cancellation.reason.clone(), CancelOrigin::Member(index));
                }
            });
            combined.watcher.link(link);
            if combined.is_cancelled() {
                break;
            }
        }
        combined
    }

    /// Cancel the signal. Returns `true` only for the call that actually cancelled it.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        self.watcher.inner.cancel_with(reason.into(), CancelOrigin::Direct)
    }

    pub fn watcher(&self) -> SignalWatcher {
        self.watcher.clone()
    }
}

impl Default for CancellationSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for CancellationSignal {
    type Target = SignalWatcher;

    fn deref(&self) -> &SignalWatcher {
        &self.watcher
    }
}

impl std::fmt::Debug for CancellationSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CancellationSignal").field(&self.watcher).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn cancel_is_idempotent() {
        let signal = CancellationSignal::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        signal.register(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(signal.cancel("first"));
        assert!(!signal.cancel("second"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(signal.reason().as_deref(), Some("first"));
    }

    #[test]
    fn callbacks_run_in_registration_order() {
        let signal = CancellationSignal::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let order = order.clone();
            signal.register(move |_| order.lock().unwrap().push(i));
        }
        signal.cancel("done");
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn register_after_cancel_runs_immediately() {
        let signal = CancellationSignal::new();
        signal.cancel("early");

        let seen = Arc::new(Mutex::new(None));
        let slot = seen.clone();
        signal.register(move |c| *slot.lock().unwrap() = Some(c.reason.clone()));

        assert_eq!(seen.lock().unwrap().as_deref(), Some("early"));
        assert_eq!(signal.pending_callbacks(), 0);
    }

    #[test]
    fn unregister_removes_callback() {
        let signal = CancellationSignal::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let registration = signal.register(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(signal.pending_callbacks(), 1);

        registration.unregister();
        assert_eq!(signal.pending_callbacks(), 0);

        signal.cancel("nobody listening");
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_callback_does_not_block_the_rest() {
        let signal = CancellationSignal::new();
        let fired = Arc::new(AtomicUsize::new(0));

        signal.register(|_| panic!("cleanup exploded"));
        let counter = fired.clone();
        signal.register(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(signal.cancel("boom"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn check_reports_reason_and_time() {
        let signal = CancellationSignal::new();
        assert!(signal.check().is_ok());

        signal.cancel("user abort");
        let err = signal.check().unwrap_err();
        assert_eq!(err.reason, "user abort");
        assert_eq!(err.origin, CancelOrigin::Direct);
        assert_eq!(signal.cancelled_at(), Some(err.at));
    }

    #[test]
    fn child_of_cancelled_parent_starts_cancelled() {
        let parent = CancellationSignal::new();
        parent.cancel("gone");

        let child = CancellationSignal::child_of(&parent);
        let cancellation = child.cancellation().unwrap();
        assert_eq!(cancellation.origin, CancelOrigin::Parent);
        assert_eq!(cancellation.reason, "gone");
    }

    #[test]
    fn dropping_child_unlinks_from_parent() {
        let parent = CancellationSignal::new();
        {
            let _child = CancellationSignal::child_of(&parent);
            assert_eq!(parent.pending_callbacks(), 1);
        }
        assert_eq!(parent.pending_callbacks(), 0);
    }

    #[test]
    fn child_keeps_weak_parent() {
        let parent = CancellationSignal::builder().label("root").build();
        let child = CancellationSignal::child_of(&parent);
        assert_eq!(child.parent().map(|p| p.label().to_string()).as_deref(), Some("root"));

        drop(parent);
        assert!(child.parent().is_none());
        assert!(!child.is_cancelled());
    }

    #[test]
    fn any_records_triggering_member() {
        let a = CancellationSignal::new();
        let b = CancellationSignal::new();
        let c = CancellationSignal::new();
        let combined = CancellationSignal::any(&[&a, &b, &c]);

        assert!(b.cancel("b went first"));
        a.cancel("a second");

        let cancellation = combined.cancellation().unwrap();
        assert_eq!(cancellation.origin, CancelOrigin::Member(1));
        assert_eq!(cancellation.reason, "b went first");
    }

    #[test]
    fn any_with_already_cancelled_member() {
        let a = CancellationSignal::new();
        let b = CancellationSignal::new();
        b.cancel("already");

        let combined = CancellationSignal::any(&[&a, &b]);
        assert_eq!(combined.cancellation().unwrap().origin, CancelOrigin::Member(1));
    }

    #[tokio::test]
    async fn cancelled_resolves_immediately_when_already_cancelled() {
        let signal = CancellationSignal::new();
        signal.cancel("done");
        let cancellation = signal.cancelled().await;
        assert_eq!(cancellation.reason, "done");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cancels_with_timeout_origin() {
        let signal = CancellationSignal::with_timeout(Duration::from_millis(250));
        assert!(signal.deadline().is_some());

        let cancellation = signal.cancelled().await;
        assert_eq!(cancellation.origin, CancelOrigin::Timeout);
        assert_eq!(cancellation.reason, "timeout after 250ms");
    }

    #[tokio::test(start_paused = true)]
    async fn manual_cancel_disarms_timer() {
        let signal = CancellationSignal::with_timeout(Duration::from_millis(50));
        assert!(signal.cancel("manual"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let cancellation = signal.cancellation().unwrap();
        assert_eq!(cancellation.origin, CancelOrigin::Direct);
        assert_eq!(cancellation.reason, "manual");
    }
}
