//! Advisory distributed lock on top of [`Backplane::set_nx_ex`].
//!
//! Acquisition blocks with exponential backoff and gives up with
//! [`BackplaneError::LockContended`] after a bounded number of attempts.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use super::backplane::{Backplane, BackplaneError};

const LOCK_PREFIX: &str = "lock-";

#[derive(Debug, Clone)]
pub struct LockPolicy {
    /// How long the lock survives if its holder never releases it.
    pub ttl: Duration,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            max_attempts: 8,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
        }
    }
}

impl LockPolicy {
    /// Delay before retry number `attempt` (1-based), jittered by up to 50%.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let delay = exp.min(self.max_delay);
        let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2);
        delay + Duration::from_millis(jitter_ms)
    }
}

/// A held lock. Call [`LockGuard::release`] when done; a guard that is dropped
/// instead simply expires after the policy TTL.
#[must_use = "a lock guard should be released"]
pub struct LockGuard {
    backplane: Arc<dyn Backplane>,
    key: String,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn release(self) -> Result<(), BackplaneError> {
        tracing::debug!(key = %self.key, "releasing lock");
        self.backplane.del(&self.key).await
    }
}

/// Acquire the lock named `name`.
pub async fn acquire(
    backplane: Arc<dyn Backplane>,
    name: &str,
    policy: &LockPolicy,
) -> Result<LockGuard, BackplaneError> {
    let key = format!("{LOCK_PREFIX}{name}");
    let attempts = policy.max_attempts.max(1);

    for attempt in 1..=attempts {
        if backplane.set_nx_ex(&key, "1", policy.ttl).await? {
            tracing::debug!(%key, attempt, "lock acquired");
            return Ok(LockGuard { backplane, key });
        }
        if attempt < attempts {
            tokio::time::sleep(policy.backoff(attempt)).await;
        }
    }

    Err(BackplaneError::LockContended { key, attempts })
}
