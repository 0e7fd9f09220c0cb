//! Fair asynchronous lock with timeouts and forced release.
//!
//! Waiters are granted strictly in arrival order. The holder slot is only ever filled
//! from the head of the queue, and that hand-off happens in the same critical section
//! that clears the previous holder, so there is no window for a newcomer to jump the
//! queue.
//!
//! Every grant arms a watchdog for the caller's timeout. A holder that outlives it is
//! force-released with a warning and the next waiter is granted; the stale guard's
//! eventual release is then an ignored no-op.

use serde_json::json;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::LockTimeout;

/// Counters and timings, read through [`FairLock::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockStats {
    pub acquired: u64,
    pub released: u64,
    /// Queued callers that gave up.
    pub timeouts: u64,
    /// Waits that ended because the grant channel closed without a grant.
    pub abandoned_waits: u64,
    /// Holders removed by the watchdog.
    pub force_released: u64,
    /// Releases from guards that no longer held the lock.
    pub ignored_releases: u64,
    pub max_wait: Duration,
    pub total_wait: Duration,
    pub max_hold: Duration,
    /// Longest hold that ended in a force-release.
    pub max_anomalous_hold: Duration,
}

impl LockStats {
    pub fn average_wait(&self) -> Duration {
        if self.acquired == 0 {
            return Duration::ZERO;
        }
        let nanos = self.total_wait.as_nanos() / u128::from(self.acquired);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

/// Snapshot of the current holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HolderInfo {
    pub owner: String,
    pub held_for: Duration,
}

struct Holder {
    ticket: u64,
    owner: String,
    acquired_at: Instant,
    watchdog: Option<JoinHandle<()>>,
}

struct Waiter {
    ticket: u64,
    owner: String,
    enqueued_at: Instant,
    timeout: Duration,
    grant: oneshot::Sender<LockGuard>,
}

#[derive(Default)]
struct LockState {
    holder: Option<Holder>,
    queue: VecDeque<Waiter>,
    next_ticket: u64,
    stats: LockStats,
}

struct LockShared {
    name: String,
    default_timeout: Duration,
    state: Mutex<LockState>,
}

impl LockShared {
    fn lock_state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(self: &Arc<Self>, ticket: u64, owner: &str) {
        let mut state = self.lock_state();
        match state.holder.take() {
            Some(holder) if holder.ticket == ticket => {
                if let Some(watchdog) = holder.watchdog {
                    watchdog.abort();
                }
                let held = holder.acquired_at.elapsed();
                state.stats.released += 1;
                state.stats.max_hold = state.stats.max_hold.max(held);
                debug!(
                    lock = %self.name,
                    owner = %owner,
                    held_ms = held.as_millis() as u64,
                    waiting = state.queue.len(),
                    "lock released"
                );
                grant_next(self, &mut state);
            }
            other => {
                state.holder = other;
                state.stats.ignored_releases += 1;
                warn!(
                    lock = %self.name,
                    owner = %owner,
                    holder = state.holder.as_ref().map(|h| h.owner.as_str()).unwrap_or("nobody"),
                    "ignoring release from a guard that no longer holds the lock"
                );
            }
        }
    }

    fn force_release(self: &Arc<Self>, ticket: u64) {
        let mut state = self.lock_state();
        let stale = matches!(&state.holder, Some(holder) if holder.ticket == ticket);
        if !stale {
            return;
        }
        let Some(holder) = state.holder.take() else {
            return;
        };
        // We are running inside the watchdog; dropping its handle detaches it.
        let held = holder.acquired_at.elapsed();
        state.stats.force_released += 1;
        state.stats.max_hold = state.stats.max_hold.max(held);
        state.stats.max_anomalous_hold = state.stats.max_anomalous_hold.max(held);
        warn!(
            lock = %self.name,
            previous_holder = %holder.owner,
            held_ms = held.as_millis() as u64,
            waiting = state.queue.len(),
            "holder exceeded its timeout, force-releasing lock"
        );
        grant_next(self, &mut state);
    }

    /// Drop a queued waiter. Returns false if it was already granted.
    fn remove_waiter(&self, ticket: u64) -> bool {
        let removed = {
            let mut state = self.lock_state();
            state
                .queue
                .iter()
                .position(|w| w.ticket == ticket)
                .and_then(|index| state.queue.remove(index))
        };
        removed.is_some()
    }
}

/// Install a holder and arm its watchdog. Caller holds the state lock.
fn install(
    shared: &Arc<LockShared>,
    state: &mut LockState,
    ticket: u64,
    owner: String,
    enqueued_at: Instant,
    timeout: Duration,
) -> LockGuard {
    let acquired_at = Instant::now();
    let wait = acquired_at.saturating_duration_since(enqueued_at);

    let weak: Weak<LockShared> = Arc::downgrade(shared);
    let watchdog = tokio::runtime::Handle::try_current().ok().map(|handle| {
        handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(shared) = weak.upgrade() {
                shared.force_release(ticket);
            }
        })
    });

    state.holder = Some(Holder {
        ticket,
        owner: owner.clone(),
        acquired_at,
        watchdog,
    });
    state.stats.acquired += 1;
    state.stats.total_wait = state.stats.total_wait.saturating_add(wait);
    state.stats.max_wait = state.stats.max_wait.max(wait);

    debug!(
        lock = %shared.name,
        owner = %owner,
        wait_ms = wait.as_millis() as u64,
        timeout_ms = timeout.as_millis() as u64,
        "lock granted"
    );

    LockGuard {
        shared: shared.clone(),
        ticket,
        owner,
        acquired_at,
        armed: true,
    }
}

/// Hand the lock to the queue head. Caller holds the state lock with no holder set.
fn grant_next(shared: &Arc<LockShared>, state: &mut LockState) {
    while let Some(waiter) = state.queue.pop_front() {
        let guard = install(
            shared,
            state,
            waiter.ticket,
            waiter.owner,
            waiter.enqueued_at,
            waiter.timeout,
        );
        match waiter.grant.send(guard) {
            Ok(()) => return,
            Err(mut guard) => {
                // Receiver vanished between dequeue and grant; undo and try the next one.
                guard.armed = false;
                if let Some(holder) = state.holder.take() {
                    if let Some(watchdog) = holder.watchdog {
                        watchdog.abort();
                    }
                }
                state.stats.acquired -= 1;
                debug!(lock = %shared.name, owner = %guard.owner, "waiter gone before grant");
            }
        }
    }
}

/// Removes a queued waiter if the `acquire` future is dropped mid-wait.
struct PendingWaiter<'a> {
    shared: &'a LockShared,
    ticket: u64,
    armed: bool,
}

impl PendingWaiter<'_> {
    fn defuse(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingWaiter<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.remove_waiter(self.ticket);
        }
    }
}

/// Proof of holding a [`FairLock`]. Releases on drop.
pub struct LockGuard {
    shared: Arc<LockShared>,
    ticket: u64,
    owner: String,
    acquired_at: Instant,
    armed: bool,
}

impl LockGuard {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// False once the watchdog has force-released this hold.
    pub fn is_held(&self) -> bool {
        if !self.armed {
            return false;
        }
        let state = self.shared.lock_state();
        matches!(&state.holder, Some(holder) if holder.ticket == self.ticket)
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.armed {
            self.armed = false;
            self.shared.release(self.ticket, &self.owner);
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("lock", &self.shared.name)
            .field("owner", &self.owner)
            .field("ticket", &self.ticket)
            .finish()
    }
}

/// Fair FIFO async lock. Clones share the same lock.
#[derive(Clone)]
pub struct FairLock {
    shared: Arc<LockShared>,
}

impl FairLock {
    pub fn new(name: impl Into<String>, default_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(LockShared {
                name: name.into(),
                default_timeout,
                state: Mutex::new(LockState::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn default_timeout(&self) -> Duration {
        self.shared.default_timeout
    }

    /// Wait for the lock in FIFO order.
    ///
    /// `timeout` (or the lock default) bounds both the wait in the queue and, once
    /// granted, the hold itself; see the module docs for what happens to long holds.
    pub async fn acquire(
        &self,
        owner: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<LockGuard, LockTimeout> {
        let owner = owner.into();
        let timeout = timeout.unwrap_or(self.shared.default_timeout);
        let enqueued_at = Instant::now();

        let (ticket, mut rx) = {
            let mut state = self.shared.lock_state();
            let ticket = state.next_ticket;
            state.next_ticket += 1;

            if state.holder.is_none() && state.queue.is_empty() {
                return Ok(install(
                    &self.shared,
                    &mut state,
                    ticket,
                    owner,
                    enqueued_at,
                    timeout,
                ));
            }

            let (grant, rx) = oneshot::channel();
            state.queue.push_back(Waiter {
                ticket,
                owner: owner.clone(),
                enqueued_at,
                timeout,
                grant,
            });
            debug!(
                lock = %self.shared.name,
                owner = %owner,
                position = state.queue.len(),
                "waiting for lock"
            );
            (ticket, rx)
        };

        let pending = PendingWaiter {
            shared: &self.shared,
            ticket,
            armed: true,
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(guard)) => {
                pending.defuse();
                return Ok(guard);
            }
            Ok(Err(_)) => {
                // Our queue entry was dropped without a grant, so nothing timed out.
                pending.defuse();
                let holder = {
                    let mut state = self.shared.lock_state();
                    state.stats.abandoned_waits += 1;
                    state.holder.as_ref().map(|h| h.owner.clone())
                };
                warn!(
                    lock = %self.shared.name,
                    owner = %owner,
                    waited_ms = enqueued_at.elapsed().as_millis() as u64,
                    holder = holder.as_deref().unwrap_or("nobody"),
                    "lock wait abandoned without a grant"
                );
                return Err(LockTimeout {
                    lock: self.shared.name.clone(),
                    owner,
                    timeout,
                    holder,
                });
            }
            Err(_) => {
                let still_queued = self.shared.remove_waiter(ticket);
                pending.defuse();
                if !still_queued {
                    // Granted in the same instant we gave up; the guard is in the channel.
                    if let Ok(guard) = rx.try_recv() {
                        return Ok(guard);
                    }
                }
            }
        }

        let holder = {
            let mut state = self.shared.lock_state();
            state.stats.timeouts += 1;
            state.holder.as_ref().map(|h| h.owner.clone())
        };
        warn!(
            lock = %self.shared.name,
            owner = %owner,
            timeout_ms = timeout.as_millis() as u64,
            holder = holder.as_deref().unwrap_or("nobody"),
            "lock wait timed out"
        );
        Err(LockTimeout {
            lock: self.shared.name.clone(),
            owner,
            timeout,
            holder,
        })
    }

    /// Run `f` while holding the lock. The lock is released on every exit path,
    /// including errors, panics and the returned future being dropped.
    pub async fn with_lock<T, E, F, Fut>(
        &self,
        owner: impl Into<String>,
        timeout: Option<Duration>,
        f: F,
    ) -> Result<T, E>
    where
        E: From<LockTimeout>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let guard = self.acquire(owner, timeout).await?;
        let result = f().await;
        if !guard.is_held() {
            warn!(
                lock = %self.shared.name,
                owner = %guard.owner(),
                held_ms = guard.held_for().as_millis() as u64,
                "critical section finished after its hold was force-released"
            );
        }
        guard.release();
        result
    }

    pub fn is_locked(&self) -> bool {
        self.shared.lock_state().holder.is_some()
    }

    pub fn queue_length(&self) -> usize {
        self.shared.lock_state().queue.len()
    }

    pub fn holder(&self) -> Option<HolderInfo> {
        self.shared
            .lock_state()
            .holder
            .as_ref()
            .map(|holder| HolderInfo {
                owner: holder.owner.clone(),
                held_for: holder.acquired_at.elapsed(),
            })
    }

    pub fn stats(&self) -> LockStats {
        self.shared.lock_state().stats.clone()
    }

    /// Stats and current occupancy as JSON, for diagnostics output.
    pub fn summary(&self) -> serde_json::Value {
        let state = self.shared.lock_state();
        let stats = &state.stats;
        json!({
            "name": self.shared.name,
            "locked": state.holder.is_some(),
            "holder": state.holder.as_ref().map(|h| h.owner.clone()),
            "queue_length": state.queue.len(),
            "waiting": state.queue.iter().map(|w| w.owner.clone()).collect::<Vec<_>>(),
            "acquired": stats.acquired,
            "released": stats.released,
            "timeouts": stats.timeouts,
            "abandoned_waits": stats.abandoned_waits,
            "force_released": stats.force_released,
            "ignored_releases": stats.ignored_releases,
            "max_wait_ms": stats.max_wait.as_millis() as u64,
            "average_wait_ms": stats.average_wait().as_millis() as u64,
            "max_hold_ms": stats.max_hold.as_millis() as u64,
            "max_anomalous_hold_ms": stats.max_anomalous_hold.as_millis() as u64,
        })
    }
}

impl std::fmt::Debug for FairLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FairLock")
            .field("name", &self.shared.name)
            .field("locked", &self.is_locked())
            .field("queue_length", &self.queue_length())
            .finish()
    }
}
