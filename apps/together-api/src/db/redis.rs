//! Redis-backed [`Backplane`] for horizontally scaled deployments.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ExistenceCheck, SetExpiry, SetOptions};

use super::backplane::{Backplane, BackplaneError, BackplaneMessage, MessageStream};

/// Commands go through one auto-reconnecting [`ConnectionManager`]; every
/// subscription opens its own dedicated pub/sub connection.
#[derive(Clone)]
pub struct RedisBackplane {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisBackplane {
    pub async fn connect(redis_url: &str) -> Result<Self, BackplaneError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        tracing::info!("redis backplane connected");
        Ok(Self { client, conn })
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl Backplane for RedisBackplane {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BackplaneError> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<MessageStream, BackplaneError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in channels {
            pubsub.subscribe(channel).await?;
        }

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let channel = msg.get_channel_name().to_string();
            match msg.get_payload::<String>() {
                Ok(payload) => Some(BackplaneMessage { channel, payload }),
                Err(e) => {
                    tracing::warn!(?e, %channel, "undecodable pub/sub payload dropped");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BackplaneError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), BackplaneError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BackplaneError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_secs(ttl)).await?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, BackplaneError> {
        let mut conn = self.conn.clone();
        let options = SetOptions::default()
            .conditional_set(ExistenceCheck::NX)
            .with_expiration(SetExpiry::EX(ttl_secs(ttl)));
        let reply: Option<String> = conn.set_options(key, value, options).await?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> Result<(), BackplaneError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, BackplaneError> {
        let mut conn = self.conn.clone();
        Ok(conn.incr(key, 1).await?)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), BackplaneError> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), BackplaneError> {
        let mut conn = self.conn.clone();
        conn.srem::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, BackplaneError> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(key).await?)
    }
}
