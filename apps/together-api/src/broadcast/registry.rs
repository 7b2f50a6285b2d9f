//! Process-wide map from session id to its live broadcast.
//!
//! Uses `DashMap` for shard-level locking of the map itself; every session has
//! its own locks, so work on one session never blocks lookups for another. A
//! broadcast is created lazily on the first join and removed once its queue
//! signals the session closed, whether the close was requested here or came
//! from another replica.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;

use crate::config::BroadcastConfig;

use super::fanout::{MemberConnection, SessionBroadcast};
use super::queue::QueueBuilder;
use super::BroadcastError;

/// Lazily initialised registry entry. Concurrent first joins share one slot,
/// so exactly one broadcast gets started per session.
type Slot = Arc<OnceCell<Arc<SessionBroadcast>>>;

pub struct SessionRegistry {
    sessions: Arc<DashMap<String, Slot>>,
    queues: QueueBuilder,
    config: BroadcastConfig,
}

impl SessionRegistry {
    pub fn new(queues: QueueBuilder, config: BroadcastConfig) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            queues,
            config,
        }
    }

    /// Join `session_id`, starting its broadcast if this process has none yet.
    /// Returns the new member's id and the session broadcast.
    pub async fn join_session(
        &self,
        session_id: &str,
        connection: Arc<dyn MemberConnection>,
    ) -> Result<(i64, Arc<SessionBroadcast>), BroadcastError> {
        loop {
            let broadcast = self.get_or_start(session_id).await?;
            match broadcast.add_member(connection.clone()).await {
                // Closed between lookup and join: retry against a fresh broadcast.
                Err(BroadcastError::SessionClosed(_)) => {
                    self.forget_closed(session_id, &broadcast);
                    continue;
                }
                result => return result.map(|member_id| (member_id, broadcast)),
            }
        }
    }

    /// Close `session_id` on every replica. Local teardown happens once the
    /// queue's close signal fires.
    pub async fn close_session(&self, session_id: &str) {
        tracing::info!(%session_id, "closing session");
        match self.get(session_id) {
            Some(broadcast) => broadcast.close().await,
            None => self.queues.announce_closed(session_id).await,
        }
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionBroadcast>> {
        self.sessions
            .get(session_id)
            .and_then(|slot| slot.get().cloned())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.get(session_id).is_some()
    }

    /// Number of sessions with a live broadcast in this process.
    pub fn len(&self) -> usize {
        self.sessions.iter().filter(|slot| slot.get().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn get_or_start(&self, session_id: &str) -> Result<Arc<SessionBroadcast>, BroadcastError> {
        loop {
            let slot: Slot = self
                .sessions
                .entry(session_id.to_string())
                .or_default()
                .clone();

            let started = slot
                .get_or_try_init(|| self.start(session_id, slot.clone()))
                .await;

            match started {
                Ok(broadcast) if !broadcast.is_closed() => return Ok(broadcast.clone()),
                Ok(broadcast) => {
                    let broadcast = broadcast.clone();
                    self.forget_closed(session_id, &broadcast);
                }
                Err(e) => {
                    self.sessions
                        .remove_if(session_id, |_, s| Arc::ptr_eq(s, &slot) && s.get().is_none());
                    return Err(e);
                }
            }
        }
    }

    async fn start(&self, session_id: &str, slot: Slot) -> Result<Arc<SessionBroadcast>, BroadcastError> {
        let queue = self.queues.build(session_id);
        queue.initialise().await?;

        let broadcast = SessionBroadcast::new(queue, self.config.echo_self);
        broadcast.spawn_fanout(self.config.fanout_tick);
        self.spawn_close_listener(&broadcast, slot);

        tracing::info!(%session_id, "session broadcast started");
        Ok(broadcast)
    }

    /// Remove the session's entry once it closes, unless the entry has already
    /// been replaced by a newer broadcast.
    fn spawn_close_listener(&self, broadcast: &Arc<SessionBroadcast>, slot: Slot) {
        let sessions = self.sessions.clone();
        let session_id = broadcast.session_id().to_string();
        let mut closed = broadcast.on_session_closed();
        tokio::spawn(async move {
            closed.wait().await;
            if sessions
                .remove_if(&session_id, |_, s| Arc::ptr_eq(s, &slot))
                .is_some()
            {
                tracing::info!(%session_id, "session removed from registry");
            }
        });
    }

    fn forget_closed(&self, session_id: &str, closed: &Arc<SessionBroadcast>) {
        self.sessions.remove_if(session_id, |_, slot| {
            slot.get().is_some_and(|current| Arc::ptr_eq(current, closed))
        });
    }
}
