//! Two-tier storage: an in-process cache in front of a durable store.

use async_trait::async_trait;
use std::time::Duration;
use tracing::trace;

use super::{effective_ttl, MemoryStorage, RedisStorage, RedisStorageConfig, Storage, Value};
use crate::error::Result;

/// Longest time a value lives in the fast tier.
pub const FAST_TIER_TTL: Duration = Duration::from_secs(60);

/// Cache-aside reads and write-through writes over two tiers.
///
/// Reads hit the fast tier first and backfill it from the durable tier on a
/// miss. Writes go to both tiers, with the fast-tier TTL clamped to
/// [`FAST_TIER_TTL`]. Increments bypass the fast tier entirely: the cached
/// copy is invalidated and the durable tier performs the atomic update.
#[derive(Debug)]
pub struct HybridStorage<D: Storage = RedisStorage> {
    fast: MemoryStorage,
    durable: D,
}

impl<D: Storage> HybridStorage<D> {
    /// Combine a fast tier and a durable tier.
    pub fn new(fast: MemoryStorage, durable: D) -> Self {
        Self { fast, durable }
    }

    /// The in-process tier.
    pub fn fast(&self) -> &MemoryStorage {
        &self.fast
    }

    /// The durable tier.
    pub fn durable(&self) -> &D {
        &self.durable
    }
}

impl HybridStorage<RedisStorage> {
    /// Connect the durable tier to Redis and front it with a fresh cache.
    pub async fn connect(
        url: &str,
        config: RedisStorageConfig,
        fast_capacity: usize,
    ) -> Result<Self> {
        let durable = RedisStorage::connect_with_config(url, config).await?;
        Ok(Self::new(MemoryStorage::new(fast_capacity), durable))
    }
}

#[async_trait]
impl<D: Storage> Storage for HybridStorage<D> {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        if let Some(value) = self.fast.get(key).await? {
            return Ok(Some(value));
        }

        let value = self.durable.get(key).await?;
        if let Some(ref value) = value {
            trace!(key = %key, "Backfilling fast tier");
            self.fast
                .set(key, value.clone(), Some(FAST_TIER_TTL))
                .await?;
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        let fast_ttl = effective_ttl(ttl).map_or(FAST_TIER_TTL, |t| t.min(FAST_TIER_TTL));

        self.durable.set(key, value.clone(), ttl).await?;
        self.fast.set(key, value, Some(fast_ttl)).await
    }

    async fn incr(&self, key: &str, delta: f64) -> Result<f64> {
        self.fast.delete(key).await?;
        self.durable.incr(key, delta).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.fast.delete(key).await?;
        self.durable.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        if self.fast.exists(key).await? {
            return Ok(true);
        }
        self.durable.exists(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn hybrid() -> (HybridStorage<MemoryStorage>, ManualClock) {
        let clock = ManualClock::new(0.0);
        let fast = MemoryStorage::with_clock(100, Arc::new(clock.clone()));
        let durable = MemoryStorage::with_clock(100, Arc::new(clock.clone()));
        (HybridStorage::new(fast, durable), clock)
    }

    #[tokio::test]
    async fn test_write_through_to_both_tiers() {
        let (storage, _clock) = hybrid();

        storage.set("k", Value::Number(3.0), None).await.unwrap();

        assert_eq!(storage.fast().get("k").await.unwrap(), Some(Value::Number(3.0)));
        assert_eq!(
            storage.durable().get("k").await.unwrap(),
            Some(Value::Number(3.0))
        );
    }

    #[tokio::test]
    async fn test_fast_tier_ttl_is_clamped() {
        let (storage, clock) = hybrid();

        storage
            .set("k", Value::Number(1.0), Some(Duration::from_secs(600)))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(61));

        assert!(!storage.fast().exists("k").await.unwrap());
        assert!(storage.durable().exists("k").await.unwrap());
        // Still readable through the durable tier.
        assert_eq!(storage.get("k").await.unwrap(), Some(Value::Number(1.0)));
    }

    #[tokio::test]
    async fn test_short_ttl_applies_to_both_tiers() {
        let (storage, clock) = hybrid();

        storage
            .set("k", Value::Number(1.0), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(6));

        assert!(!storage.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_read_miss_backfills_fast_tier() {
        let (storage, clock) = hybrid();

        storage
            .durable()
            .set("k", Value::from("cold"), None)
            .await
            .unwrap();
        assert!(!storage.fast().exists("k").await.unwrap());

        assert_eq!(storage.get("k").await.unwrap(), Some(Value::from("cold")));
        assert_eq!(storage.fast().get("k").await.unwrap(), Some(Value::from("cold")));

        clock.advance(Duration::from_secs(61));
        assert!(!storage.fast().exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_incr_invalidates_fast_tier() {
        let (storage, _clock) = hybrid();

        storage.set("n", Value::Number(10.0), None).await.unwrap();
        assert_eq!(storage.incr("n", 5.0).await.unwrap(), 15.0);

        assert!(!storage.fast().exists("n").await.unwrap());
        assert_eq!(storage.get("n").await.unwrap(), Some(Value::Number(15.0)));
    }

    #[tokio::test]
    async fn test_delete_removes_from_both_tiers() {
        let (storage, _clock) = hybrid();

        storage.set("k", Value::Number(1.0), None).await.unwrap();
        storage.delete("k").await.unwrap();

        assert!(!storage.fast().exists("k").await.unwrap());
        assert!(!storage.durable().exists("k").await.unwrap());
        assert_eq!(storage.get("k").await.unwrap(), None);
    }
}
