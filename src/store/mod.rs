//! Shared key-value state behind token revocation, login throttling, and rate limiting.
//!
//! Every operation is atomic for a single key; nothing in the crate relies on
//! multi-key transactions. Multi-step operations that must not interleave
//! (increment + expiry, prune + count + insert) are exposed as single primitives so
//! backends can run them in one round trip.

pub mod memory;
pub mod redis;
#[cfg(test)]
pub(crate) mod testing;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("unexpected value under {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Outcome of one sliding-window admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowDecision {
    Admitted { remaining: u64 },
    Rejected { retry_after: Duration },
}

#[async_trait]
pub trait RevocationStore: Send + Sync + std::fmt::Debug {
    /// Backend name for health reporting.
    fn backend(&self) -> &'static str;

    /// Store `value` under `key`, replacing any previous value. A zero TTL removes the key.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Returns whether a key was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Remove and return the value. Of several concurrent callers at most one gets `Some`.
    async fn get_and_delete(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Increment the counter under `key` (absent counts as zero) and reset its TTL.
    async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, StoreError>;

    /// Remaining lifetime, `None` for absent keys or keys without expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Drop timestamps at or before `now_ms - window`, then record `now_ms` if fewer
    /// than `limit` remain. Runs as a single atomic step.
    async fn admit_sliding_window(
        &self,
        key: &str,
        now_ms: u64,
        window: Duration,
        limit: u64,
    ) -> Result<WindowDecision, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// Key layout shared by every backend.
pub mod keys {
    #[must_use]
    pub fn revoked(token: &str) -> String {
        format!("token_blacklist:{token}")
    }

    #[must_use]
    pub fn session(refresh_token: &str) -> String {
        format!("refresh:{refresh_token}")
    }

    #[must_use]
    pub fn access_link(jti: &str) -> String {
        format!("access_link:{jti}")
    }

    /// The username is length-prefixed: both parts may contain `:` (IPv6 clients).
    #[must_use]
    pub fn login_attempts(username: &str, client_id: &str) -> String {
        format!("login_attempts:{}:{username}:{client_id}", username.len())
    }

    #[must_use]
    pub fn rate_limit(subject: &str) -> String {
        format!("rate_limit:{subject}")
    }
}

pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::keys;

    #[test]
    fn login_attempt_keys_do_not_collide_across_ipv6_clients() {
        let victim = keys::login_attempts("victim", "2001:db8::1");
        let shifted = keys::login_attempts("victim:2001", "db8::1");
        assert_ne!(victim, shifted);
        assert_eq!(victim, "login_attempts:6:victim:2001:db8::1");
    }
}
