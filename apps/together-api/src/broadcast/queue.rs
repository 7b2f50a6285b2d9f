//! The event queue contract and its single-process body.
//!
//! An [`EventQueue`] owns a session's position cache, hands out member ids and
//! propagates member-left / session-closed events. [`LocalEventQueue`] keeps
//! everything in process; [`DistributedEventQueue`] routes every mutation through
//! the backplane so all replicas converge on the same snapshot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use together_common::PositionState;
use tokio::sync::watch;

use crate::config::BroadcastConfig;
use crate::db::backplane::Backplane;

use super::distributed::{self, DistributedEventQueue};
use super::position::{now_millis, PositionCache, INACTIVITY_WINDOW};
use super::BroadcastError;

// ---------------------------------------------------------------------------
// Completion signal
// ---------------------------------------------------------------------------

/// Set-once "session closed" flag that any number of tasks can await.
pub struct ClosedSignal {
    tx: watch::Sender<bool>,
}

impl ClosedSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Flip the signal. Returns `true` only for the call that flipped it.
    pub fn fire(&self) -> bool {
        self.tx.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> SessionClosed {
        SessionClosed {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for ClosedSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half of a [`ClosedSignal`].
#[derive(Clone)]
pub struct SessionClosed {
    rx: watch::Receiver<bool>,
}

impl SessionClosed {
    /// Resolves once the session is closed. Cancel safe.
    pub async fn wait(&mut self) {
        // An error means the signal itself is gone, which only happens on teardown.
        let _ = self.rx.wait_for(|closed| *closed).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.rx.borrow()
    }
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

#[async_trait]
pub trait EventQueue: Send + Sync {
    fn session_id(&self) -> &str;

    /// Idempotent setup. For the distributed body: recover the persisted
    /// snapshot and start the backplane listener.
    async fn initialise(&self) -> Result<(), BroadcastError>;

    /// A member id never issued before for this session, on any replica.
    async fn next_member_id(&self) -> Result<i64, BroadcastError>;

    /// Record a member's new position. No-op once closed.
    async fn session_member_position_change(&self, update: PositionState);

    /// Drop a member's position. No-op once closed.
    async fn member_left(&self, member_id: i64);

    /// Close the session. Only the first call has an effect.
    async fn close_session(&self);

    /// Currently valid positions, ordered by member id. Clears the dirty flag
    /// and prunes stale entries from the cache.
    fn snapshot(&self) -> Vec<PositionState>;

    /// Whether anything changed since the last snapshot and the session is open.
    /// Positions that aged out of the inactivity window count as a change.
    fn refresh_needed(&self) -> bool;

    /// Force the next fan-out pass to broadcast, e.g. so a newcomer gets the
    /// current state.
    fn request_refresh(&self);

    fn on_session_closed(&self) -> SessionClosed;

    fn is_closed(&self) -> bool;
}

// ---------------------------------------------------------------------------
// State shared by both bodies
// ---------------------------------------------------------------------------

pub(crate) struct QueueState {
    session_id: String,
    inactivity_window: Duration,
    cache: Mutex<PositionCache>,
    closed: AtomicBool,
    signal: ClosedSignal,
}

impl QueueState {
    pub(crate) fn new(session_id: &str, inactivity_window: Duration) -> Self {
        Self {
            session_id: session_id.to_string(),
            inactivity_window,
            cache: Mutex::new(PositionCache::new()),
            closed: AtomicBool::new(false),
            signal: ClosedSignal::new(),
        }
    }

    pub(crate) fn session_id(&self) -> &str {
        &self.session_id
    }

    pub(crate) fn apply(&self, update: PositionState) {
        self.cache.lock().apply(update);
    }

    pub(crate) fn remove(&self, member_id: i64) -> bool {
        self.cache.lock().remove(member_id)
    }

    pub(crate) fn restore(&self, entries: HashMap<i64, PositionState>) -> usize {
        let mut cache = self.cache.lock();
        cache.restore(entries, now_millis(), self.inactivity_window);
        cache.len()
    }

    /// Prune the cache and serialize what is left for persistence.
    pub(crate) fn persistable(&self) -> Result<String, serde_json::Error> {
        let mut cache = self.cache.lock();
        cache.prune(now_millis(), self.inactivity_window);
        serde_json::to_string(cache.entries())
    }

    pub(crate) fn snapshot(&self) -> Vec<PositionState> {
        self.cache
            .lock()
            .take_snapshot(now_millis(), self.inactivity_window)
    }

    pub(crate) fn refresh_needed(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut cache = self.cache.lock();
        cache.prune(now_millis(), self.inactivity_window);
        cache.is_outdated()
    }

    pub(crate) fn request_refresh(&self) {
        self.cache.lock().mark_outdated();
    }

    /// Set the closed flag. Returns `true` for the first caller only.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Fire the completion signal (once).
    pub(crate) fn finish(&self) {
        if self.signal.fire() {
            tracing::info!(session_id = %self.session_id, "session closed");
        }
    }

    pub(crate) fn on_session_closed(&self) -> SessionClosed {
        self.signal.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Local body
// ---------------------------------------------------------------------------

/// Event queue for a single process: mutations apply directly to the cache.
pub struct LocalEventQueue {
    state: QueueState,
    member_count: AtomicI64,
}

impl LocalEventQueue {
    pub fn new(session_id: &str, inactivity_window: Duration) -> Self {
        Self {
            state: QueueState::new(session_id, inactivity_window),
            member_count: AtomicI64::new(0),
        }
    }
}

#[async_trait]
impl EventQueue for LocalEventQueue {
    fn session_id(&self) -> &str {
        self.state.session_id()
    }

    async fn initialise(&self) -> Result<(), BroadcastError> {
        Ok(())
    }

    async fn next_member_id(&self) -> Result<i64, BroadcastError> {
        if self.state.is_closed() {
            return Err(BroadcastError::SessionClosed(self.session_id().to_string()));
        }
        let member_id = self.member_count.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(session_id = %self.session_id(), member_id, "member id allocated");
        Ok(member_id)
    }

    async fn session_member_position_change(&self, update: PositionState) {
        if self.state.is_closed() {
            return;
        }
        self.state.apply(update);
    }

    async fn member_left(&self, member_id: i64) {
        if self.state.is_closed() {
            return;
        }
        if self.state.remove(member_id) {
            tracing::debug!(session_id = %self.session_id(), member_id, "member position dropped");
        }
    }

    async fn close_session(&self) {
        if self.state.mark_closed() {
            self.state.finish();
        }
    }

    fn snapshot(&self) -> Vec<PositionState> {
        self.state.snapshot()
    }

    fn refresh_needed(&self) -> bool {
        self.state.refresh_needed()
    }

    fn request_refresh(&self) {
        self.state.request_refresh();
    }

    fn on_session_closed(&self) -> SessionClosed {
        self.state.on_session_closed()
    }

    fn is_closed(&self) -> bool {
        self.state.is_closed()
    }
}

// ---------------------------------------------------------------------------
// Backend selection
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub enum QueueBackend {
    Local,
    Distributed(Arc<dyn Backplane>),
}

/// Builds the configured event queue body for each new session.
#[derive(Clone)]
pub struct QueueBuilder {
    backend: QueueBackend,
    inactivity_window: Duration,
    snapshot_persist_interval: Duration,
    snapshot_ttl: Duration,
}

impl QueueBuilder {
    pub fn new(backend: QueueBackend) -> Self {
        let defaults = BroadcastConfig::default();
        Self {
            backend,
            inactivity_window: INACTIVITY_WINDOW,
            snapshot_persist_interval: defaults.snapshot_persist_interval,
            snapshot_ttl: defaults.snapshot_ttl,
        }
    }

    pub fn local() -> Self {
        Self::new(QueueBackend::Local)
    }

    pub fn distributed(backplane: Arc<dyn Backplane>) -> Self {
        Self::new(QueueBackend::Distributed(backplane))
    }

    pub fn from_config(backend: QueueBackend, config: &BroadcastConfig) -> Self {
        Self::new(backend)
            .inactivity_window(config.inactivity_window)
            .snapshot_persist_interval(config.snapshot_persist_interval)
            .snapshot_ttl(config.snapshot_ttl)
    }

    pub fn inactivity_window(mut self, window: Duration) -> Self {
        self.inactivity_window = window;
        self
    }

    pub fn snapshot_persist_interval(mut self, interval: Duration) -> Self {
        self.snapshot_persist_interval = interval;
        self
    }

    pub fn snapshot_ttl(mut self, ttl: Duration) -> Self {
        self.snapshot_ttl = ttl;
        self
    }

    pub fn build(&self, session_id: &str) -> Arc<dyn EventQueue> {
        match &self.backend {
            QueueBackend::Local => Arc::new(LocalEventQueue::new(session_id, self.inactivity_window)),
            QueueBackend::Distributed(backplane) => Arc::new(DistributedEventQueue::new(
                session_id,
                backplane.clone(),
                self.inactivity_window,
                self.snapshot_persist_interval,
                self.snapshot_ttl,
            )),
        }
    }

    /// Tell every replica that `session_id` is closed, for sessions this
    /// process holds no queue for. A no-op for the local body.
    pub async fn announce_closed(&self, session_id: &str) {
        if let QueueBackend::Distributed(backplane) = &self.backend {
            distributed::announce_closed(backplane.as_ref(), session_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(member_id: i64, selector: &str) -> PositionState {
        PositionState {
            member_id,
            x: 1.0,
            y: 2.0,
            selector: selector.to_string(),
            location: "/p".to_string(),
            updated_at: now_millis(),
        }
    }

    fn queue() -> LocalEventQueue {
        LocalEventQueue::new("s1", INACTIVITY_WINDOW)
    }

    #[test]
    fn closed_signal_fires_once() {
        let signal = ClosedSignal::new();
        let rx = signal.subscribe();
        assert!(!rx.is_closed());
        assert!(signal.fire());
        assert!(!signal.fire());
        assert!(signal.is_fired());
        assert!(rx.is_closed());
    }

    #[tokio::test]
    async fn closed_signal_wakes_every_waiter() {
        let signal = ClosedSignal::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let mut closed = signal.subscribe();
                tokio::spawn(async move { closed.wait().await })
            })
            .collect();

        signal.fire();
        for waiter in waiters {
            waiter.await.unwrap();
        }
    }

    #[tokio::test]
    async fn snapshot_holds_latest_position_per_member() {
        let q = queue();
        q.session_member_position_change(position(1, "#a")).await;
        q.session_member_position_change(position(2, "#b")).await;
        q.session_member_position_change(position(1, "#c")).await;

        assert!(q.refresh_needed());
        let snapshot = q.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].selector, "#c");
        assert!(!q.refresh_needed());
    }

    #[tokio::test]
    async fn member_left_drops_position() {
        let q = queue();
        q.session_member_position_change(position(1, "#a")).await;
        q.snapshot();
        q.member_left(1).await;
        assert!(q.refresh_needed());
        assert!(q.snapshot().is_empty());
    }

    #[tokio::test]
    async fn concurrent_member_ids_are_unique_and_increasing() {
        let q = Arc::new(queue());
        let handles: Vec<_> = (0..64)
            .map(|_| {
                let q = q.clone();
                tokio::spawn(async move { q.next_member_id().await.unwrap() })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids, (1..=64).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_mutations() {
        let q = queue();
        let closed = q.on_session_closed();
        q.session_member_position_change(position(1, "#a")).await;

        q.close_session().await;
        q.close_session().await;

        assert!(q.is_closed());
        assert!(closed.is_closed());
        assert!(!q.refresh_needed());

        q.session_member_position_change(position(2, "#b")).await;
        assert_eq!(q.snapshot().len(), 1);
        assert!(matches!(
            q.next_member_id().await,
            Err(BroadcastError::SessionClosed(_))
        ));
    }

    #[tokio::test]
    async fn request_refresh_sets_dirty_flag() {
        let q = queue();
        assert!(!q.refresh_needed());
        q.request_refresh();
        assert!(q.refresh_needed());
    }

    #[tokio::test]
    async fn idle_member_ageing_out_requests_refresh() {
        let q = LocalEventQueue::new("s1", Duration::from_millis(20));
        q.session_member_position_change(position(1, "#a")).await;
        assert_eq!(q.snapshot().len(), 1);
        assert!(!q.refresh_needed());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(q.refresh_needed());
        assert!(q.snapshot().is_empty());
        assert!(!q.refresh_needed());
    }

    #[test]
    fn builder_selects_body() {
        let local = QueueBuilder::local().build("s1");
        assert_eq!(local.session_id(), "s1");
        assert!(!local.is_closed());
    }
}
