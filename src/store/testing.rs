use super::{RevocationStore, StoreError, WindowDecision};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Store whose every operation fails with the configured error.
#[derive(Debug, Clone)]
pub struct FailingStore(pub StoreError);

impl FailingStore {
    pub fn unavailable() -> Self {
        Self(StoreError::Unavailable("connection refused".to_string()))
    }

    pub fn timing_out() -> Self {
        Self(StoreError::Timeout(Duration::from_millis(500)))
    }
}

#[async_trait]
impl RevocationStore for FailingStore {
    fn backend(&self) -> &'static str {
        "failing"
    }

    async fn set_with_ttl(&self, _: &str, _: &str, _: Duration) -> Result<(), StoreError> {
        Err(self.0.clone())
    }

    async fn get(&self, _: &str) -> Result<Option<String>, StoreError> {
        Err(self.0.clone())
    }

    async fn exists(&self, _: &str) -> Result<bool, StoreError> {
        Err(self.0.clone())
    }

    async fn delete(&self, _: &str) -> Result<bool, StoreError> {
        Err(self.0.clone())
    }

    async fn get_and_delete(&self, _: &str) -> Result<Option<String>, StoreError> {
        Err(self.0.clone())
    }

    async fn increment_with_ttl(&self, _: &str, _: Duration) -> Result<i64, StoreError> {
        Err(self.0.clone())
    }

    async fn ttl(&self, _: &str) -> Result<Option<Duration>, StoreError> {
        Err(self.0.clone())
    }

    async fn admit_sliding_window(
        &self,
        _: &str,
        _: u64,
        _: Duration,
        _: u64,
    ) -> Result<WindowDecision, StoreError> {
        Err(self.0.clone())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Err(self.0.clone())
    }
}

/// Delegating store that yields to the scheduler before every operation, so
/// tasks joined on one thread interleave at each store round-trip. Operation
/// names are recorded in call order.
#[derive(Debug)]
pub struct YieldingStore {
    inner: Arc<dyn RevocationStore>,
    ops: Mutex<Vec<&'static str>>,
}

impl YieldingStore {
    pub fn new(inner: Arc<dyn RevocationStore>) -> Self {
        Self {
            inner,
            ops: Mutex::new(Vec::new()),
        }
    }

    pub fn ops(&self) -> Vec<&'static str> {
        self.ops.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    async fn enter(&self, op: &'static str) {
        self.ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(op);
        tokio::task::yield_now().await;
    }
}

#[async_trait]
impl RevocationStore for YieldingStore {
    fn backend(&self) -> &'static str {
        self.inner.backend()
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.enter("set").await;
        self.inner.set_with_ttl(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.enter("get").await;
        self.inner.get(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.enter("exists").await;
        self.inner.exists(key).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.enter("delete").await;
        self.inner.delete(key).await
    }

    async fn get_and_delete(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.enter("getdel").await;
        self.inner.get_and_delete(key).await
    }

    async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        self.enter("incr").await;
        self.inner.increment_with_ttl(key, ttl).await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        self.enter("ttl").await;
        self.inner.ttl(key).await
    }

    async fn admit_sliding_window(
        &self,
        key: &str,
        now_ms: u64,
        window: Duration,
        limit: u64,
    ) -> Result<WindowDecision, StoreError> {
        self.enter("window").await;
        self.inner
            .admit_sliding_window(key, now_ms, window, limit)
            .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.enter("ping").await;
        self.inner.ping().await
    }
}
