//! Helpers shared by unit tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::Result;
use crate::storage::{MemoryStorage, Storage, Value};

/// Send `tracing` output to the test harness. Filter with `RUST_LOG`.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Memory storage whose writes can be switched to hang forever.
#[derive(Debug)]
pub(crate) struct StallingStorage {
    inner: MemoryStorage,
    stall_writes: AtomicBool,
}

impl StallingStorage {
    pub(crate) fn new(inner: MemoryStorage) -> Self {
        Self {
            inner,
            stall_writes: AtomicBool::new(false),
        }
    }

    pub(crate) fn stall_writes(&self, stall: bool) {
        self.stall_writes.store(stall, Ordering::SeqCst);
    }

    pub(crate) fn inner(&self) -> &MemoryStorage {
        &self.inner
    }

    async fn wait_for_write(&self) {
        if self.stall_writes.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl Storage for StallingStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        self.wait_for_write().await;
        self.inner.set(key, value, ttl).await
    }

    async fn incr(&self, key: &str, delta: f64) -> Result<f64> {
        self.wait_for_write().await;
        self.inner.incr(key, delta).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.wait_for_write().await;
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key).await
    }
}
