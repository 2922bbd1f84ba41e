//! Redis-backed store shared by every node of a deployment.

use super::{ttl_millis, RevocationStore, StoreError, WindowDecision};
use async_trait::async_trait;
use rand::{rngs::StdRng, Rng, SeedableRng};
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, RedisError, RedisResult, Script};
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};
use ulid::Ulid;

const CONNECT_ATTEMPTS: u32 = 3;
const INITIAL_RETRY_DELAY_MS: u64 = 200;

const INCREMENT_WITH_TTL: &str = r"
local count = redis.call('INCR', KEYS[1])
redis.call('PEXPIRE', KEYS[1], ARGV[1])
return count
";

// ARGV: now_ms, window_ms, limit, member. Returns {admitted, remaining, retry_after_ms}.
const SLIDING_WINDOW: &str = r"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
if count < limit then
  redis.call('ZADD', key, now, ARGV[4])
  redis.call('PEXPIRE', key, window)
  return {1, limit - count - 1, 0}
end
local retry = window
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if oldest[2] then
  retry = tonumber(oldest[2]) + window - now
end
if retry < 0 then
  retry = 0
end
redis.call('PEXPIRE', key, window)
return {0, 0, retry}
";

#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
    op_timeout: Duration,
    increment: Script,
    window: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("op_timeout", &self.op_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to `url`, retrying with exponential backoff.
    ///
    /// # Errors
    /// Returns [`StoreError::Unavailable`] if the url is invalid or every attempt fails.
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Unavailable(format!("invalid store url: {e}")))?;

        let config = ConnectionManagerConfig::new()
            .set_connection_timeout(op_timeout)
            .set_response_timeout(op_timeout)
            .set_number_of_retries(2);

        let mut rng = StdRng::from_entropy();
        let mut delay_ms = INITIAL_RETRY_DELAY_MS;
        let mut last_error = None;

        for attempt in 1..=CONNECT_ATTEMPTS {
            match ConnectionManager::new_with_config(client.clone(), config.clone()).await {
                Ok(manager) => {
                    info!(attempt, "connected to redis store");
                    return Ok(Self {
                        manager,
                        op_timeout,
                        increment: Script::new(INCREMENT_WITH_TTL),
                        window: Script::new(SLIDING_WINDOW),
                    });
                }
                Err(e) => {
                    if attempt < CONNECT_ATTEMPTS {
                        // 80-120% of the nominal delay.
                        let jittered_ms = delay_ms * rng.gen_range(80..=120) / 100;
                        warn!(
                            "redis connection attempt {attempt}/{CONNECT_ATTEMPTS} failed, retrying in {jittered_ms}ms: {e}"
                        );
                        tokio::time::sleep(Duration::from_millis(jittered_ms)).await;
                        delay_ms *= 2;
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(StoreError::Unavailable(format!(
            "failed to connect after {CONNECT_ATTEMPTS} attempts: {}",
            last_error.map_or_else(|| "unknown error".to_string(), |e| e.to_string())
        )))
    }

    async fn run<T, F>(&self, op: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = RedisResult<T>> + Send,
    {
        match timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                error!(op, "redis operation failed: {e}");
                Err(classify(&e, self.op_timeout))
            }
            Err(_) => {
                warn!(op, timeout = ?self.op_timeout, "redis operation timed out");
                Err(StoreError::Timeout(self.op_timeout))
            }
        }
    }
}

fn classify(e: &RedisError, op_timeout: Duration) -> StoreError {
    if e.is_timeout() {
        StoreError::Timeout(op_timeout)
    } else {
        StoreError::Unavailable(e.to_string())
    }
}

#[async_trait]
impl RevocationStore for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        if ttl.is_zero() {
            return self
                .run("DEL", async move { conn.del::<_, ()>(key).await })
                .await;
        }
        let ms = ttl_millis(ttl);
        self.run("PSETEX", async move { conn.pset_ex::<_, _, ()>(key, value, ms).await })
            .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.manager.clone();
        self.run("GET", async move { conn.get::<_, Option<String>>(key).await })
            .await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        self.run("EXISTS", async move { conn.exists::<_, bool>(key).await })
            .await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let removed = self
            .run("DEL", async move { conn.del::<_, i64>(key).await })
            .await?;
        Ok(removed > 0)
    }

    async fn get_and_delete(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.manager.clone();
        self.run("GETDEL", async move {
            let value: Option<String> = redis::cmd("GETDEL").arg(key).query_async(&mut conn).await?;
            Ok(value)
        })
        .await
    }

    async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let mut conn = self.manager.clone();
        let ms = ttl_millis(ttl);
        let script = &self.increment;
        self.run("INCR", async move {
            let count: i64 = script.key(key).arg(ms).invoke_async(&mut conn).await?;
            Ok(count)
        })
        .await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut conn = self.manager.clone();
        let ms = self
            .run("PTTL", async move { conn.pttl::<_, i64>(key).await })
            .await?;

        // -2: no such key, -1: no expiry
        Ok(u64::try_from(ms)
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis))
    }

    async fn admit_sliding_window(
        &self,
        key: &str,
        now_ms: u64,
        window: Duration,
        limit: u64,
    ) -> Result<WindowDecision, StoreError> {
        let mut conn = self.manager.clone();
        let window_ms = ttl_millis(window);
        let member = format!("{now_ms}-{}", Ulid::new());
        let script = &self.window;

        let reply: Vec<i64> = self
            .run("WINDOW", async move {
                let reply: Vec<i64> = script
                    .key(key)
                    .arg(now_ms)
                    .arg(window_ms)
                    .arg(limit)
                    .arg(member)
                    .invoke_async(&mut conn)
                    .await?;
                Ok(reply)
            })
            .await?;

        match reply.as_slice() {
            [1, remaining, _] => Ok(WindowDecision::Admitted {
                remaining: u64::try_from(*remaining).unwrap_or(0),
            }),
            [0, _, retry_ms] => Ok(WindowDecision::Rejected {
                retry_after: Duration::from_millis(u64::try_from(*retry_ms).unwrap_or(0)),
            }),
            other => Err(StoreError::Corrupt {
                key: key.to_string(),
                reason: format!("unexpected window reply {other:?}"),
            }),
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let reply = self
            .run("PING", async move {
                let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
                Ok(reply)
            })
            .await?;

        if reply == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!(
                "unexpected PING reply '{reply}'"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_invalid_url() {
        let result = RedisStore::connect("not a url", Duration::from_millis(50)).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }

    #[test]
    fn timeouts_are_classified() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        let err = RedisError::from(io);
        assert_eq!(
            classify(&err, Duration::from_millis(5)),
            StoreError::Timeout(Duration::from_millis(5))
        );
    }
}
