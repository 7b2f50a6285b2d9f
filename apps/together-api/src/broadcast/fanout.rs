//! Per-session fan-out of the position snapshot to connected members.
//!
//! A [`SessionBroadcast`] pairs a session's event queue with the members
//! connected to this process. Its fan-out loop wakes on a fixed tick, skips
//! cheaply when nothing changed, and otherwise writes the current snapshot to
//! every member. Members whose connection is gone are evicted after the pass.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use together_common::PositionState;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use super::queue::{EventQueue, SessionClosed};
use super::BroadcastError;

/// One outbound snapshot, shared between members where possible.
pub type Frame = Arc<Vec<PositionState>>;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("member connection is gone")]
    Disconnected,
    #[error("member connection is not keeping up")]
    Saturated,
}

/// Outbound half of a member's connection, as seen by the fan-out loop.
///
/// Delivery must not block: the loop calls it while holding the member lock.
pub trait MemberConnection: Send + Sync {
    fn deliver(&self, frame: Frame) -> Result<(), DeliveryError>;
}

impl MemberConnection for mpsc::Sender<Frame> {
    fn deliver(&self, frame: Frame) -> Result<(), DeliveryError> {
        self.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Saturated,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Disconnected,
        })
    }
}

pub struct SessionBroadcast {
    queue: Arc<dyn EventQueue>,
    members: Mutex<HashMap<i64, Arc<dyn MemberConnection>>>,
    echo_self: bool,
}

impl SessionBroadcast {
    pub fn new(queue: Arc<dyn EventQueue>, echo_self: bool) -> Arc<Self> {
        Arc::new(Self {
            queue,
            members: Mutex::new(HashMap::new()),
            echo_self,
        })
    }

    pub fn session_id(&self) -> &str {
        self.queue.session_id()
    }

    pub fn queue(&self) -> &Arc<dyn EventQueue> {
        &self.queue
    }

    /// Admit a member: allocate its id and attach its connection.
    pub async fn add_member(
        &self,
        connection: Arc<dyn MemberConnection>,
    ) -> Result<i64, BroadcastError> {
        if self.queue.is_closed() {
            return Err(BroadcastError::SessionClosed(self.session_id().to_string()));
        }
        let member_id = self.queue.next_member_id().await?;
        let count = {
            let mut members = self.members.lock();
            members.insert(member_id, connection);
            members.len()
        };
        // Newcomers get the current state on the next tick.
        self.queue.request_refresh();
        tracing::info!(session_id = %self.session_id(), member_id, members = count, "member joined");
        Ok(member_id)
    }

    pub fn remove_member(&self, member_id: i64) -> bool {
        self.members.lock().remove(&member_id).is_some()
    }

    pub fn member_count(&self) -> usize {
        self.members.lock().len()
    }

    pub async fn position_changed(&self, update: PositionState) {
        self.queue.session_member_position_change(update).await;
    }

    /// Detach a member and drop its position from the session.
    pub async fn member_left(&self, member_id: i64) {
        if self.remove_member(member_id) {
            tracing::info!(session_id = %self.session_id(), member_id, "member left");
        }
        self.queue.member_left(member_id).await;
    }

    pub async fn close(&self) {
        self.queue.close_session().await;
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    pub fn on_session_closed(&self) -> SessionClosed {
        self.queue.on_session_closed()
    }

    /// One fan-out pass. Returns how many members received a frame.
    pub async fn flush(&self) -> usize {
        if !self.queue.refresh_needed() {
            return 0;
        }

        let (delivered, unresponsive) = {
            let mut members = self.members.lock();
            let snapshot = self.queue.snapshot();
            let shared: Frame = Arc::new(snapshot);
            let mut delivered = 0;
            let mut unresponsive = Vec::new();

            for (&member_id, connection) in members.iter() {
                let frame = if self.echo_self {
                    shared.clone()
                } else {
                    Arc::new(
                        shared
                            .iter()
                            .filter(|p| p.member_id != member_id)
                            .cloned()
                            .collect(),
                    )
                };
                match connection.deliver(frame) {
                    Ok(()) => delivered += 1,
                    Err(DeliveryError::Saturated) => {
                        tracing::debug!(session_id = %self.session_id(), member_id, "member lagging, frame skipped");
                    }
                    Err(DeliveryError::Disconnected) => unresponsive.push(member_id),
                }
            }

            for member_id in &unresponsive {
                members.remove(member_id);
            }
            (delivered, unresponsive)
        };

        for member_id in unresponsive {
            tracing::info!(session_id = %self.session_id(), member_id, "unresponsive member evicted");
            self.queue.member_left(member_id).await;
        }
        delivered
    }

    /// Start the fan-out loop. It stops, and detaches every member, once the
    /// session closes.
    pub fn spawn_fanout(self: &Arc<Self>, tick: Duration) -> JoinHandle<()> {
        let broadcast = Arc::clone(self);
        tokio::spawn(async move {
            let mut closed = broadcast.on_session_closed();
            let mut ticker = time::interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = closed.wait() => break,
                    _ = ticker.tick() => {
                        broadcast.flush().await;
                    }
                }
            }

            // Dropping the senders ends every member's outbound stream.
            broadcast.members.lock().clear();
            tracing::debug!(session_id = %broadcast.session_id(), "fan-out loop stopped");
        })
    }
}
