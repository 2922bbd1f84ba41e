//! In-process store for single-node deployments and tests.
//!
//! Expiry is evaluated lazily against the injected clock on every access, and a
//! background sweeper can be spawned to reclaim keys nobody reads again.

use super::{ttl_millis, RevocationStore, StoreError, WindowDecision};
use crate::clock::{Clock, SystemClock};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug)]
enum Slot {
    Text(String),
    Counter(i64),
    Window(VecDeque<u64>),
}

#[derive(Debug)]
struct Entry {
    slot: Slot,
    expires_at: Option<u64>,
}

impl Entry {
    fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Debug, Clone)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    /// Remove every expired key, returning how many were dropped.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    /// Number of keys currently held, expired or not.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let purged = store.purge_expired().await;
                if purged > 0 {
                    debug!(purged, "purged expired keys");
                }
            }
        })
    }
}

fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str, now: u64) -> Option<&'a mut Entry> {
    if entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Corrupt {
        key: key.to_string(),
        reason: "operation against a key holding the wrong kind of value".to_string(),
    }
}

#[async_trait]
impl RevocationStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        if ttl.is_zero() {
            entries.remove(key);
            return Ok(());
        }

        let now = self.clock.now_millis();
        entries.insert(
            key.to_string(),
            Entry {
                slot: Slot::Text(value.to_string()),
                expires_at: Some(now.saturating_add(ttl_millis(ttl))),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key, now).map(|entry| &entry.slot) {
            None => Ok(None),
            Some(Slot::Text(value)) => Ok(Some(value.clone())),
            Some(Slot::Counter(count)) => Ok(Some(count.to_string())),
            Some(Slot::Window(_)) => Err(wrong_type(key)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().await;
        Ok(live(&mut entries, key, now).is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().await;
        Ok(entries
            .remove(key)
            .is_some_and(|entry| !entry.is_expired(now)))
    }

    async fn get_and_delete(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().await;
        if live(&mut entries, key, now).is_none() {
            return Ok(None);
        }
        match entries.remove(key).map(|entry| entry.slot) {
            Some(Slot::Text(value)) => Ok(Some(value)),
            Some(Slot::Counter(count)) => Ok(Some(count.to_string())),
            Some(Slot::Window(_)) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let now = self.clock.now_millis();
        let expires_at = Some(now.saturating_add(ttl_millis(ttl)));
        let mut entries = self.entries.lock().await;

        let current = match live(&mut entries, key, now).map(|entry| &entry.slot) {
            None => 0,
            Some(Slot::Counter(count)) => *count,
            Some(Slot::Text(value)) => value.parse::<i64>().map_err(|_| StoreError::Corrupt {
                key: key.to_string(),
                reason: "value is not an integer".to_string(),
            })?,
            Some(Slot::Window(_)) => return Err(wrong_type(key)),
        };

        let next = current.saturating_add(1);
        entries.insert(
            key.to_string(),
            Entry {
                slot: Slot::Counter(next),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().await;
        Ok(live(&mut entries, key, now)
            .and_then(|entry| entry.expires_at)
            .map(|at| Duration::from_millis(at.saturating_sub(now))))
    }

    async fn admit_sliding_window(
        &self,
        key: &str,
        now_ms: u64,
        window: Duration,
        limit: u64,
    ) -> Result<WindowDecision, StoreError> {
        let window_ms = ttl_millis(window);
        let cutoff = now_ms.saturating_sub(window_ms);
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().await;

        if entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
            entries.remove(key);
        }
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            slot: Slot::Window(VecDeque::new()),
            expires_at: None,
        });
        let Slot::Window(timestamps) = &mut entry.slot else {
            return Err(wrong_type(key));
        };

        timestamps.retain(|&at| at > cutoff);
        let count = timestamps.len() as u64;

        if count < limit {
            let position = timestamps.partition_point(|&at| at <= now_ms);
            timestamps.insert(position, now_ms);
            entry.expires_at = Some(now.saturating_add(window_ms));
            return Ok(WindowDecision::Admitted {
                remaining: limit - count - 1,
            });
        }

        let retry_after = timestamps
            .front()
            .map_or(window_ms, |&oldest| {
                oldest.saturating_add(window_ms).saturating_sub(now_ms)
            });
        entry.expires_at = Some(now.saturating_add(window_ms));
        Ok(WindowDecision::Rejected {
            retry_after: Duration::from_millis(retry_after),
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
