//! Sliding-window request limiter shared across nodes through the store.

use crate::clock::Clock;
use crate::store::{keys, RevocationStore, StoreError, WindowDecision};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_LIMIT: u64 = 100;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// What to do when the store cannot answer a rate-limit check.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitFailureMode {
    /// Reject the request.
    #[default]
    Closed,
    /// Admit the request and log a warning.
    Open,
}

impl FromStr for RateLimitFailureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "closed" => Ok(Self::Closed),
            "open" => Ok(Self::Open),
            other => Err(format!("unknown failure mode '{other}', expected closed or open")),
        }
    }
}

impl fmt::Display for RateLimitFailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Open => f.write_str("open"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub limit: u64,
    pub window: Duration,
    pub failure_mode: RateLimitFailureMode,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            window: DEFAULT_WINDOW,
            failure_mode: RateLimitFailureMode::Closed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitSubject {
    User(i64),
    Client(String),
}

impl RateLimitSubject {
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            Self::User(id) => keys::rate_limit(&format!("user:{id}")),
            Self::Client(address) => keys::rate_limit(&format!("ip:{address}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed { remaining: u64 },
    /// The store failed and the limiter is configured to fail open.
    Unchecked,
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limit exceeded, retry in {}s", retry_after.as_secs())]
    Exceeded { retry_after: Duration },
    #[error("rate limit store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct SlidingWindowLimiter {
    config: RateLimitConfig,
    store: Arc<dyn RevocationStore>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowLimiter {
    #[must_use]
    pub fn new(
        config: RateLimitConfig,
        store: Arc<dyn RevocationStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            clock,
        }
    }

    #[must_use]
    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Record one request for `subject`.
    ///
    /// # Errors
    /// Returns [`RateLimitError::Exceeded`] when the window is full, and
    /// [`RateLimitError::StoreUnavailable`] on store failure unless failing open.
    pub async fn check(
        &self,
        subject: &RateLimitSubject,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let key = subject.key();
        let now = self.clock.now_millis();

        match self
            .store
            .admit_sliding_window(&key, now, self.config.window, self.config.limit)
            .await
        {
            Ok(WindowDecision::Admitted { remaining }) => {
                Ok(RateLimitDecision::Allowed { remaining })
            }
            Ok(WindowDecision::Rejected { retry_after }) => {
                Err(RateLimitError::Exceeded { retry_after })
            }
            Err(err) => match self.config.failure_mode {
                RateLimitFailureMode::Closed => Err(err.into()),
                RateLimitFailureMode::Open => {
                    warn!(key, "rate limit check failed, admitting request: {err}");
                    Ok(RateLimitDecision::Unchecked)
                }
            },
        }
    }
}
