//! Session metadata directory.
//!
//! Records live next to the broadcast state on the backplane so every replica
//! sees the same set of sessions. Mutations are serialized per session through
//! the distributed lock.

use std::sync::Arc;

use async_trait::async_trait;

use crate::models::session::SessionRecord;

use super::backplane::{Backplane, BackplaneError};
use super::lock::{self, LockPolicy};

const SESSIONS_KEY: &str = "sessions";
const SESSION_PREFIX: &str = "session-";

#[async_trait]
pub trait SessionDirectory: Send + Sync {
    async fn store(&self, record: &SessionRecord) -> Result<(), BackplaneError>;
    async fn list(&self) -> Result<Vec<SessionRecord>, BackplaneError>;
    async fn get(&self, id: &str) -> Result<Option<SessionRecord>, BackplaneError>;
    /// Returns whether a record was removed.
    async fn delete(&self, id: &str) -> Result<bool, BackplaneError>;
}

pub struct BackplaneDirectory {
    backplane: Arc<dyn Backplane>,
    lock_policy: LockPolicy,
}

impl BackplaneDirectory {
    pub fn new(backplane: Arc<dyn Backplane>) -> Self {
        Self::with_lock_policy(backplane, LockPolicy::default())
    }

    pub fn with_lock_policy(backplane: Arc<dyn Backplane>, lock_policy: LockPolicy) -> Self {
        Self {
            backplane,
            lock_policy,
        }
    }
}

/// Key holding a session's JSON record.
pub fn record_key(id: &str) -> String {
    format!("{SESSION_PREFIX}{id}")
}

#[async_trait]
impl SessionDirectory for BackplaneDirectory {
    async fn store(&self, record: &SessionRecord) -> Result<(), BackplaneError> {
        let value = serde_json::to_string(record)?;
        let guard = lock::acquire(self.backplane.clone(), &record.id, &self.lock_policy).await?;

        let result = async {
            self.backplane.sadd(SESSIONS_KEY, &record.id).await?;
            self.backplane.set(&record_key(&record.id), &value).await
        }
        .await;

        guard.release().await?;
        result?;
        tracing::info!(session_id = %record.id, "session stored");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SessionRecord>, BackplaneError> {
        let mut records = Vec::new();
        for id in self.backplane.smembers(SESSIONS_KEY).await? {
            match self.get(&id).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => tracing::debug!(session_id = %id, "indexed session has no record"),
                Err(e) => tracing::warn!(?e, session_id = %id, "skipping unreadable session"),
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn get(&self, id: &str) -> Result<Option<SessionRecord>, BackplaneError> {
        match self.backplane.get(&record_key(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, id: &str) -> Result<bool, BackplaneError> {
        let guard = lock::acquire(self.backplane.clone(), id, &self.lock_policy).await?;

        let result = async {
            let existed = self.backplane.get(&record_key(id)).await?.is_some();
            self.backplane.srem(SESSIONS_KEY, id).await?;
            self.backplane.del(&record_key(id)).await?;
            Ok::<_, BackplaneError>(existed)
        }
        .await;

        guard.release().await?;
        let existed = result?;
        if existed {
            tracing::info!(session_id = %id, "session deleted");
        }
        Ok(existed)
    }
}
