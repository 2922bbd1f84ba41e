//! Brute-force protection for the login endpoint.
//!
//! Failures are counted per `(username, client)` pair. Once the count reaches
//! `max_attempts` the pair stays locked until the counter's TTL runs out; every
//! further failure pushes the TTL back out to the full lockout window.

use crate::audit;
use crate::store::{keys, RevocationStore, StoreError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_LOCKOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("account locked, retry in {}s", remaining.as_secs())]
    LockedAccount { remaining: Duration },
    #[error("login attempt store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardConfig {
    pub max_attempts: u32,
    pub lockout: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            lockout: DEFAULT_LOCKOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoginGuard {
    config: GuardConfig,
    store: Arc<dyn RevocationStore>,
}

impl LoginGuard {
    #[must_use]
    pub fn new(config: GuardConfig, store: Arc<dyn RevocationStore>) -> Self {
        Self { config, store }
    }

    #[must_use]
    pub fn config(&self) -> GuardConfig {
        self.config
    }

    /// # Errors
    /// Returns [`GuardError::LockedAccount`] while the pair is locked, and
    /// [`GuardError::StoreUnavailable`] when the counter cannot be read.
    pub async fn check_allowed(&self, username: &str, client_id: &str) -> Result<(), GuardError> {
        let key = keys::login_attempts(username, client_id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(());
        };

        let count: i64 = raw.parse().map_err(|_| StoreError::Corrupt {
            key: key.clone(),
            reason: "login attempt counter is not an integer".to_string(),
        })?;
        if count < i64::from(self.config.max_attempts) {
            return Ok(());
        }

        // The counter may expire between the two reads.
        match self.store.ttl(&key).await? {
            Some(remaining) => Err(GuardError::LockedAccount { remaining }),
            None => Ok(()),
        }
    }

    /// Count a failed attempt and return the new total.
    ///
    /// # Errors
    /// Returns [`GuardError::StoreUnavailable`] when the counter cannot be written.
    pub async fn record_failure(&self, username: &str, client_id: &str) -> Result<i64, GuardError> {
        let key = keys::login_attempts(username, client_id);
        let count = self
            .store
            .increment_with_ttl(&key, self.config.lockout)
            .await?;

        if count >= i64::from(self.config.max_attempts) {
            warn!(
                target: audit::TARGET,
                event = "login.locked",
                username,
                client = client_id,
                attempts = count,
                "login locked after repeated failures"
            );
        } else {
            debug!(username, client = client_id, attempts = count, "failed login recorded");
        }
        Ok(count)
    }

    /// # Errors
    /// Returns [`GuardError::StoreUnavailable`] when the counter cannot be removed.
    pub async fn record_success(&self, username: &str, client_id: &str) -> Result<(), GuardError> {
        self.store
            .delete(&keys::login_attempts(username, client_id))
            .await?;
        Ok(())
    }
}
