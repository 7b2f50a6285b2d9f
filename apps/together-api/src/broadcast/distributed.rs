//! Event queue body for replicas sharing a backplane.
//!
//! Writes are never applied synchronously: updates are published on the
//! session's position channel and applied by the listener every replica runs
//! (the publisher's own included), so all replicas see the same eventual view.
//!
//! Backplane layout per session:
//! - `position-<id>`: JSON [`PositionState`] messages
//! - `control-<id>`: `MEM_LEFT;<memberId>` and `CLOSED`
//! - `snapshot-<id>`: last persisted cache (JSON object keyed by member id)
//! - `memberId-<id>`: member id counter

use std::collections::HashMap;
use std::num::ParseIntError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use together_common::PositionState;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::db::backplane::{Backplane, BackplaneMessage, MessageStream};
use crate::db::directory::record_key;

use super::queue::{EventQueue, QueueState, SessionClosed};
use super::BroadcastError;

/// Pause between two resubscription attempts after the subscription dropped.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

pub fn position_channel(session_id: &str) -> String {
    format!("position-{session_id}")
}

pub fn control_channel(session_id: &str) -> String {
    format!("control-{session_id}")
}

pub fn snapshot_key(session_id: &str) -> String {
    format!("snapshot-{session_id}")
}

pub fn member_id_key(session_id: &str) -> String {
    format!("memberId-{session_id}")
}

/// Lifecycle messages carried on the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    MemberLeft(i64),
    Closed,
}

impl ControlMessage {
    const MEMBER_LEFT: &'static str = "MEM_LEFT";
    const CLOSED: &'static str = "CLOSED";

    pub fn encode(&self) -> String {
        match self {
            Self::MemberLeft(member_id) => format!("{};{member_id}", Self::MEMBER_LEFT),
            Self::Closed => Self::CLOSED.to_string(),
        }
    }

    /// `Ok(None)` for tags this version does not know.
    pub fn parse(payload: &str) -> Result<Option<Self>, ParseIntError> {
        let mut parts = payload.split(';');
        match parts.next().unwrap_or_default() {
            Self::MEMBER_LEFT => {
                let member_id = parts.next().unwrap_or_default().trim().parse()?;
                Ok(Some(Self::MemberLeft(member_id)))
            }
            Self::CLOSED => Ok(Some(Self::Closed)),
            _ => Ok(None),
        }
    }
}

/// Publish `CLOSED` for a session and drop its recovery snapshot.
pub(crate) async fn announce_closed(backplane: &dyn Backplane, session_id: &str) {
    let closed = ControlMessage::Closed.encode();
    if let Err(e) = backplane.publish(&control_channel(session_id), &closed).await {
        tracing::warn!(?e, %session_id, "failed to publish session close");
    }
    if let Err(e) = backplane.del(&snapshot_key(session_id)).await {
        tracing::warn!(?e, %session_id, "failed to drop session snapshot");
    }
}

pub struct DistributedEventQueue {
    state: Arc<QueueState>,
    backplane: Arc<dyn Backplane>,
    persist_interval: Duration,
    snapshot_ttl: Duration,
    initialised: AtomicBool,
}

impl DistributedEventQueue {
    pub fn new(
        session_id: &str,
        backplane: Arc<dyn Backplane>,
        inactivity_window: Duration,
        persist_interval: Duration,
        snapshot_ttl: Duration,
    ) -> Self {
        Self {
            state: Arc::new(QueueState::new(session_id, inactivity_window)),
            backplane,
            persist_interval,
            snapshot_ttl,
            initialised: AtomicBool::new(false),
        }
    }

    fn channels(&self) -> Vec<String> {
        let session_id = self.state.session_id();
        vec![position_channel(session_id), control_channel(session_id)]
    }

    async fn recover_snapshot(&self) {
        let session_id = self.state.session_id();
        let raw = match self.backplane.get(&snapshot_key(session_id)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(?e, %session_id, "could not load session snapshot");
                return;
            }
        };
        match serde_json::from_str::<HashMap<i64, PositionState>>(&raw) {
            Ok(entries) => {
                let recovered = self.state.restore(entries);
                tracing::info!(%session_id, recovered, "session snapshot recovered");
            }
            Err(e) => tracing::warn!(?e, %session_id, "discarding corrupt session snapshot"),
        }
    }

    async fn publish(&self, channel: String, payload: &str) {
        if let Err(e) = self.backplane.publish(&channel, payload).await {
            tracing::warn!(?e, session_id = %self.state.session_id(), %channel, "publish dropped");
        }
    }
}

#[async_trait]
impl EventQueue for DistributedEventQueue {
    fn session_id(&self) -> &str {
        self.state.session_id()
    }

    async fn initialise(&self) -> Result<(), BroadcastError> {
        if self.initialised.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.recover_snapshot().await;

        let stream = match self.backplane.subscribe(&self.channels()).await {
            Ok(stream) => stream,
            Err(source) => {
                self.initialised.store(false, Ordering::SeqCst);
                return Err(BroadcastError::Subscribe {
                    session_id: self.session_id().to_string(),
                    source,
                });
            }
        };

        let listener = Listener {
            state: self.state.clone(),
            backplane: self.backplane.clone(),
            channels: self.channels(),
            persist_interval: self.persist_interval,
            snapshot_ttl: self.snapshot_ttl,
        };
        tokio::spawn(listener.run(stream));
        Ok(())
    }

    async fn next_member_id(&self) -> Result<i64, BroadcastError> {
        let session_id = self.state.session_id();
        let member_id = self
            .backplane
            .incr(&member_id_key(session_id))
            .await
            .map_err(|source| BroadcastError::MemberIdAllocation {
                session_id: session_id.to_string(),
                source,
            })?;
        tracing::debug!(%session_id, member_id, "member id allocated");
        Ok(member_id)
    }

    async fn session_member_position_change(&self, update: PositionState) {
        if self.state.is_closed() {
            return;
        }
        match serde_json::to_string(&update) {
            Ok(payload) => {
                self.publish(position_channel(self.state.session_id()), &payload)
                    .await
            }
            Err(e) => tracing::warn!(?e, "failed to encode position update"),
        }
    }

    async fn member_left(&self, member_id: i64) {
        if self.state.is_closed() {
            return;
        }
        let payload = ControlMessage::MemberLeft(member_id).encode();
        self.publish(control_channel(self.state.session_id()), &payload)
            .await;
    }

    async fn close_session(&self) {
        if !self.state.mark_closed() {
            return;
        }
        announce_closed(self.backplane.as_ref(), self.state.session_id()).await;
        self.state.finish();
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
// Listener
// ---------------------------------------------------------------------------

enum Flow {
    Continue,
    Stop,
}

/// Background task applying backplane traffic to the local cache and
/// periodically persisting the recovery snapshot.
struct Listener {
    state: Arc<QueueState>,
    backplane: Arc<dyn Backplane>,
    channels: Vec<String>,
    persist_interval: Duration,
    snapshot_ttl: Duration,
}

impl Listener {
    async fn run(self, mut stream: MessageStream) {
        let session_id = self.state.session_id().to_string();
        let mut closed = self.state.on_session_closed();
        let mut persist = time::interval_at(Instant::now() + self.persist_interval, self.persist_interval);
        persist.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(%session_id, "session listener started");
        loop {
            tokio::select! {
                _ = closed.wait() => break,
                _ = persist.tick() => self.persist_snapshot().await,
                msg = stream.next() => match msg {
                    Some(msg) => {
                        if let Flow::Stop = self.handle(&msg) {
                            break;
                        }
                    }
                    None => {
                        let Some(fresh) = self.resubscribe(&mut closed).await else {
                            break;
                        };
                        // CLOSED may have been published while we were away.
                        if !self.session_still_exists().await {
                            tracing::info!(%session_id, "session deleted while unsubscribed");
                            self.state.mark_closed();
                            self.state.finish();
                            break;
                        }
                        stream = fresh;
                    }
                },
            }
        }
        tracing::debug!(%session_id, "session listener stopped");
    }

    fn handle(&self, msg: &BackplaneMessage) -> Flow {
        let session_id = self.state.session_id();
        tracing::trace!(%session_id, channel = %msg.channel, payload = %msg.payload, "backplane message");

        if msg.channel == position_channel(session_id) {
            match serde_json::from_str::<PositionState>(&msg.payload) {
                Ok(update) => self.state.apply(update),
                Err(e) => tracing::warn!(?e, %session_id, "malformed position update dropped"),
            }
            return Flow::Continue;
        }

        match ControlMessage::parse(&msg.payload) {
            Ok(Some(ControlMessage::MemberLeft(member_id))) => {
                if self.state.remove(member_id) {
                    tracing::debug!(%session_id, member_id, "member position dropped");
                }
                Flow::Continue
            }
            Ok(Some(ControlMessage::Closed)) => {
                self.state.mark_closed();
                self.state.finish();
                Flow::Stop
            }
            Ok(None) => {
                tracing::debug!(%session_id, payload = %msg.payload, "unknown control message ignored");
                Flow::Continue
            }
            Err(e) => {
                tracing::warn!(?e, %session_id, payload = %msg.payload, "malformed control message dropped");
                Flow::Continue
            }
        }
    }

    async fn persist_snapshot(&self) {
        let session_id = self.state.session_id();
        let snapshot = match self.state.persistable() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(?e, %session_id, "failed to encode session snapshot");
                return;
            }
        };
        if let Err(e) = self
            .backplane
            .set_ex(&snapshot_key(session_id), &snapshot, self.snapshot_ttl)
            .await
        {
            tracing::warn!(?e, %session_id, "failed to persist session snapshot");
        }
    }

    /// Whether the session record is still there. Lookup failures count as yes;
    /// only a confirmed deletion closes the session.
    async fn session_still_exists(&self) -> bool {
        let session_id = self.state.session_id();
        match self.backplane.get(&record_key(session_id)).await {
            Ok(record) => record.is_some(),
            Err(e) => {
                tracing::warn!(?e, %session_id, "could not check session record");
                true
            }
        }
    }

    /// Keep trying to subscribe again until it works or the session closes.
    async fn resubscribe(&self, closed: &mut SessionClosed) -> Option<MessageStream> {
        let session_id = self.state.session_id();
        tracing::warn!(%session_id, "session subscription lost, resubscribing");
        loop {
            tokio::select! {
                _ = closed.wait() => return None,
                _ = time::sleep(RESUBSCRIBE_DELAY) => {}
            }
            match self.backplane.subscribe(&self.channels).await {
                Ok(stream) => {
                    tracing::info!(%session_id, "session subscription restored");
                    return Some(stream);
                }
                Err(e) => tracing::warn!(?e, %session_id, "resubscribe failed"),
            }
        }
    }
}
