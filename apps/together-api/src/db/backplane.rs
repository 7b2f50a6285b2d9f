//! Shared publish/subscribe + key-value service that lets replicas cooperate.
//!
//! Backed by Redis when horizontally scaled and by an in-process map otherwise
//! (and in tests). Two queues sharing one [`MemoryBackplane`] behave exactly like
//! two replicas sharing one Redis.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum BackplaneError {
    #[error("backplane unavailable: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("malformed backplane payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("lock `{key}` still contended after {attempts} attempts")]
    LockContended { key: String, attempts: u32 },
}

/// A message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackplaneMessage {
    pub channel: String,
    pub payload: String,
}

pub type MessageStream = BoxStream<'static, BackplaneMessage>;

#[async_trait]
pub trait Backplane: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BackplaneError>;

    /// Subscribe to every channel in `channels`. The subscription is live when
    /// this returns; the stream ends only if the underlying connection is lost.
    async fn subscribe(&self, channels: &[String]) -> Result<MessageStream, BackplaneError>;

    async fn get(&self, key: &str) -> Result<Option<String>, BackplaneError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), BackplaneError>;
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BackplaneError>;

    /// Set `key` only if it does not exist yet. Returns whether it was set.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, BackplaneError>;

    async fn del(&self, key: &str) -> Result<(), BackplaneError>;

    /// Atomically increment a counter, returning the new value. Missing keys start at 0.
    async fn incr(&self, key: &str) -> Result<i64, BackplaneError>;

    async fn sadd(&self, key: &str, member: &str) -> Result<(), BackplaneError>;
    async fn srem(&self, key: &str, member: &str) -> Result<(), BackplaneError>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>, BackplaneError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation (single process / tests)
// ---------------------------------------------------------------------------

struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Delivery end of one subscription. Every channel of a subscription shares the
/// same sender, so its stream yields messages in publish order across channels.
type Subscriber = mpsc::UnboundedSender<BackplaneMessage>;

#[derive(Default)]
pub struct MemoryBackplane {
    values: Mutex<HashMap<String, StoredValue>>,
    sets: Mutex<HashMap<String, HashSet<String>>>,
    topics: Mutex<HashMap<String, Vec<Subscriber>>>,
}

impl MemoryBackplane {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let mut values = self.values.lock();
        let now = Instant::now();
        match values.get(key) {
            Some(stored) if stored.is_live(now) => Some(stored.value.clone()),
            Some(_) => {
                values.remove(key);
                None
            }
            None => None,
        }
    }

    fn insert(&self, key: &str, value: String, ttl: Option<Duration>) {
        self.values.lock().insert(
            key.to_string(),
            StoredValue {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }

    /// End every live subscription stream, as a dropped Redis connection would.
    #[cfg(test)]
    pub(crate) fn drop_subscriptions(&self) {
        self.topics.lock().clear();
    }
}

/// Forget subscribers whose stream was dropped, and topics nobody listens to.
fn prune_topics(topics: &mut HashMap<String, Vec<Subscriber>>) {
    topics.retain(|_, subscribers| {
        subscribers.retain(|tx| !tx.is_closed());
        !subscribers.is_empty()
    });
}

#[async_trait]
impl Backplane for MemoryBackplane {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BackplaneError> {
        // Sending under the lock keeps one global publish order.
        let mut topics = self.topics.lock();
        if let Some(subscribers) = topics.get_mut(channel) {
            subscribers.retain(|tx| {
                tx.send(BackplaneMessage {
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                })
                .is_ok()
            });
            if subscribers.is_empty() {
                topics.remove(channel);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<MessageStream, BackplaneError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut topics = self.topics.lock();
        prune_topics(&mut topics);
        for channel in channels {
            topics.entry(channel.clone()).or_default().push(tx.clone());
        }
        Ok(stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BackplaneError> {
        Ok(self.live_value(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), BackplaneError> {
        self.insert(key, value.to_string(), None);
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BackplaneError> {
        self.insert(key, value.to_string(), Some(ttl));
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, BackplaneError> {
        let mut values = self.values.lock();
        let now = Instant::now();
        if values.get(key).is_some_and(|stored| stored.is_live(now)) {
            return Ok(false);
        }
        values.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<(), BackplaneError> {
        self.values.lock().remove(key);
        self.sets.lock().remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, BackplaneError> {
        let mut values = self.values.lock();
        let now = Instant::now();
        let current = values
            .get(key)
            .filter(|stored| stored.is_live(now))
            .and_then(|stored| stored.value.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + 1;
        values.insert(
            key.to_string(),
            StoredValue {
                value: next.to_string(),
                expires_at: None,
            },
        );
        Ok(next)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), BackplaneError> {
        self.sets
            .lock()
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), BackplaneError> {
        let mut sets = self.sets.lock();
        if let Some(set) = sets.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                sets.remove(key);
            }
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, BackplaneError> {
        Ok(self
            .sets
            .lock()
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }
}
