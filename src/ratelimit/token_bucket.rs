//! Token bucket limiters.
//!
//! A bucket holds up to `burst` tokens and refills continuously at
//! `rate / per` tokens per second. A request is admitted when the refilled
//! bucket holds at least the requested amount.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::backend::Limiter;
use super::locks::{KeyLocks, DEFAULT_LOCK_SHARDS};
use super::purge::PurgeIdle;
use super::state::{self, Snapshot};
use super::stats::LimiterStats;
use super::{check_tokens, scoped_key, DEFAULT_SCOPE};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::storage::Storage;

/// Refill `stored` up to `now`, starting from a full bucket when absent.
fn refill(stored: Option<Snapshot>, now: f64, burst: f64, refill_rate: f64) -> f64 {
    match stored {
        None => burst,
        Some(s) => {
            let elapsed = (now - s.updated_at).max(0.0);
            burst.min(s.value + elapsed * refill_rate)
        }
    }
}

/// Storage-backed token bucket.
///
/// State for each `"{scope}:{key}"` lives in the configured [`Storage`], so
/// several processes sharing a remote store share the same buckets. Partial
/// refill is persisted on rejection too, so elapsed time is never lost.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    per: f64,
    burst: f64,
    refill_rate: f64,
    scope: String,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    locks: KeyLocks,
}

impl TokenBucket {
    /// Allow `rate` tokens every `per` seconds, with a burst equal to `rate`.
    pub fn new(rate: f64, per: f64, storage: Arc<dyn Storage>) -> Self {
        Self {
            rate,
            per,
            burst: rate,
            refill_rate: rate / per,
            scope: DEFAULT_SCOPE.to_string(),
            storage,
            clock: SystemClock::shared(),
            locks: KeyLocks::new(DEFAULT_LOCK_SHARDS),
        }
    }

    /// Set the bucket capacity.
    pub fn with_burst(mut self, burst: f64) -> Self {
        self.burst = burst;
        self
    }

    /// Set the key namespace.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// Read time from `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Size the per-key lock table.
    pub fn with_lock_shards(mut self, shards: usize) -> Self {
        self.locks = KeyLocks::new(shards);
        self
    }

    /// Tokens granted per `per` seconds.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Refill period in seconds.
    pub fn per(&self) -> f64 {
        self.per
    }

    /// Bucket capacity.
    pub fn burst(&self) -> f64 {
        self.burst
    }

    fn idle_ttl(&self) -> Option<Duration> {
        state::idle_ttl(self.burst / self.refill_rate)
    }
}

#[async_trait]
impl Limiter for TokenBucket {
    async fn acquire(&self, key: &str, tokens: f64) -> Result<bool> {
        check_tokens(tokens)?;
        let key = scoped_key(&self.scope, key);
        let _guard = self.locks.lock(&key).await;

        let now = self.clock.now();
        let stored = state::load(self.storage.as_ref(), &key).await?;
        let available = refill(stored, now, self.burst, self.refill_rate);

        let admitted = available >= tokens;
        let remaining = if admitted { available - tokens } else { available };

        state::store(
            self.storage.as_ref(),
            &key,
            Snapshot {
                value: remaining,
                updated_at: now,
            },
            self.idle_ttl(),
        )
        .await?;

        if admitted {
            trace!(key = %key, tokens, remaining, "Token bucket admitted request");
        } else {
            debug!(key = %key, tokens, available, "Token bucket rejected request");
        }
        Ok(admitted)
    }

    async fn release(&self, key: &str, tokens: f64) -> Result<()> {
        check_tokens(tokens)?;
        let key = scoped_key(&self.scope, key);
        let _guard = self.locks.lock(&key).await;

        let now = self.clock.now();
        let stored = state::load(self.storage.as_ref(), &key).await?;
        let refilled = refill(stored, now, self.burst, self.refill_rate);

        state::store(
            self.storage.as_ref(),
            &key,
            Snapshot {
                value: self.burst.min(refilled + tokens),
                updated_at: now,
            },
            self.idle_ttl(),
        )
        .await
    }

    async fn get_stats(&self, key: &str) -> Result<LimiterStats> {
        let key = scoped_key(&self.scope, key);
        let now = self.clock.now();
        let stored = state::load(self.storage.as_ref(), &key).await?;

        Ok(LimiterStats::TokenBucket {
            available_tokens: refill(stored, now, self.burst, self.refill_rate),
            max_tokens: self.burst,
            refill_rate: self.refill_rate,
            last_update: stored.map_or(now, |s| s.updated_at),
        })
    }
}

/// In-process token bucket that never touches a [`Storage`].
///
/// Same algorithm as [`TokenBucket`], kept in a sharded concurrent map.
/// Faster, but buckets are private to this process.
#[derive(Debug)]
pub struct FastTokenBucket {
    rate: f64,
    per: f64,
    burst: f64,
    refill_rate: f64,
    scope: String,
    buckets: DashMap<String, Snapshot>,
    clock: Arc<dyn Clock>,
}

impl FastTokenBucket {
    /// Allow `rate` tokens every `per` seconds, with a burst equal to `rate`.
    pub fn new(rate: f64, per: f64) -> Self {
        Self {
            rate,
            per,
            burst: rate,
            refill_rate: rate / per,
            scope: DEFAULT_SCOPE.to_string(),
            buckets: DashMap::new(),
            clock: SystemClock::shared(),
        }
    }

    /// Set the bucket capacity.
    pub fn with_burst(mut self, burst: f64) -> Self {
        self.burst = burst;
        self
    }

    /// Set the key namespace.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// Read time from `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Tokens granted per `per` seconds.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Refill period in seconds.
    pub fn per(&self) -> f64 {
        self.per
    }

    /// Number of keys with a live bucket.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[async_trait]
impl Limiter for FastTokenBucket {
    async fn acquire(&self, key: &str, tokens: f64) -> Result<bool> {
        check_tokens(tokens)?;
        let key = scoped_key(&self.scope, key);
        let now = self.clock.now();

        let mut bucket = self.buckets.entry(key).or_insert(Snapshot {
            value: self.burst,
            updated_at: now,
        });
        let available = refill(Some(*bucket), now, self.burst, self.refill_rate);

        let admitted = available >= tokens;
        bucket.value = if admitted { available - tokens } else { available };
        bucket.updated_at = now;

        if !admitted {
            debug!(key = %bucket.key(), tokens, available, "Fast token bucket rejected request");
        }
        Ok(admitted)
    }

    async fn release(&self, key: &str, tokens: f64) -> Result<()> {
        check_tokens(tokens)?;
        let key = scoped_key(&self.scope, key);
        if let Some(mut bucket) = self.buckets.get_mut(&key) {
            bucket.value = self.burst.min(bucket.value + tokens);
        }
        Ok(())
    }

    async fn get_stats(&self, key: &str) -> Result<LimiterStats> {
        let key = scoped_key(&self.scope, key);
        let now = self.clock.now();
        let stored = self.buckets.get(&key).map(|b| *b);

        Ok(LimiterStats::TokenBucket {
            available_tokens: refill(stored, now, self.burst, self.refill_rate),
            max_tokens: self.burst,
            refill_rate: self.refill_rate,
            last_update: stored.map_or(now, |s| s.updated_at),
        })
    }
}

impl PurgeIdle for FastTokenBucket {
    /// Drop buckets that have refilled to `burst`.
    fn purge_idle(&self) -> usize {
        let now = self.clock.now();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| refill(Some(*bucket), now, self.burst, self.refill_rate) < self.burst);
        before.saturating_sub(self.buckets.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::{MemoryStorage, Value};
    use crate::testing::{init_tracing, StallingStorage};
    use tokio_test::{assert_err, assert_ok};

    fn bucket(rate: f64, per: f64) -> (TokenBucket, ManualClock) {
        let clock = ManualClock::new(1_000.0);
        let storage = Arc::new(MemoryStorage::with_clock(1_000, Arc::new(clock.clone())));
        let limiter = TokenBucket::new(rate, per, storage).with_clock(Arc::new(clock.clone()));
        (limiter, clock)
    }

    #[tokio::test]
    async fn test_admits_burst_then_rejects() {
        let (limiter, _clock) = bucket(5.0, 1.0);

        let mut admitted = 0;
        for _ in 0..10 {
            if limiter.acquire_one("k").await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }

    #[tokio::test]
    async fn test_first_five_admitted_next_five_rejected() {
        let (limiter, _clock) = bucket(5.0, 1.0);

        let results: Vec<bool> = {
            let mut out = Vec::new();
            for _ in 0..10 {
                out.push(limiter.acquire_one("k").await.unwrap());
            }
            out
        };
        assert_eq!(&results[..5], &[true; 5]);
        assert_eq!(&results[5..], &[false; 5]);
    }

    #[tokio::test]
    async fn test_fractional_burst_admits_floor() {
        let (limiter, _clock) = bucket(2.0, 1.0);
        let limiter = limiter.with_burst(3.5);

        let mut admitted = 0;
        for _ in 0..6 {
            if limiter.acquire_one("k").await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 3);
    }

    #[tokio::test]
    async fn test_refills_over_time() {
        let (limiter, clock) = bucket(2.0, 1.0);

        assert!(limiter.acquire("k", 2.0).await.unwrap());
        assert!(!limiter.acquire_one("k").await.unwrap());

        clock.advance(Duration::from_millis(250));
        assert!(!limiter.acquire_one("k").await.unwrap());

        // Partial refill from the rejected attempt was kept.
        clock.advance(Duration::from_millis(250));
        assert!(limiter.acquire_one("k").await.unwrap());
        assert!(!limiter.acquire_one("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_refill_uses_per() {
        let (limiter, clock) = bucket(10.0, 60.0);

        assert!(limiter.acquire("k", 10.0).await.unwrap());
        clock.advance(Duration::from_secs(5));
        assert!(!limiter.acquire_one("k").await.unwrap());

        clock.advance(Duration::from_secs(2));
        assert!(limiter.acquire_one("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_never_exceeds_burst() {
        let (limiter, clock) = bucket(5.0, 1.0);

        limiter.acquire_one("k").await.unwrap();
        clock.advance(Duration::from_secs(3_600));

        let stats = limiter.get_stats("k").await.unwrap();
        assert_eq!(stats.available(), 5.0);
        assert!(!limiter.acquire("k", 6.0).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_caps_at_burst() {
        let (limiter, _clock) = bucket(5.0, 1.0);

        assert!(limiter.acquire("k", 3.0).await.unwrap());
        limiter.release("k", 2.0).await.unwrap();
        assert_eq!(limiter.get_stats("k").await.unwrap().available(), 4.0);

        limiter.release("k", 100.0).await.unwrap();
        assert_eq!(limiter.get_stats("k").await.unwrap().available(), 5.0);
    }

    #[tokio::test]
    async fn test_keys_and_scopes_are_independent() {
        let clock = ManualClock::new(0.0);
        let storage: Arc<dyn Storage> =
            Arc::new(MemoryStorage::with_clock(100, Arc::new(clock.clone())));
        let api = TokenBucket::new(1.0, 1.0, storage.clone())
            .with_scope("api")
            .with_clock(Arc::new(clock.clone()));
        let jobs = TokenBucket::new(1.0, 1.0, storage.clone())
            .with_scope("jobs")
            .with_clock(Arc::new(clock.clone()));

        assert!(api.acquire_one("user").await.unwrap());
        assert!(!api.acquire_one("user").await.unwrap());
        assert!(api.acquire_one("other").await.unwrap());
        assert!(jobs.acquire_one("user").await.unwrap());

        assert!(storage.exists("api:user").await.unwrap());
        assert!(storage.exists("jobs:user").await.unwrap());
    }

    #[tokio::test]
    async fn test_state_is_shared_through_storage() {
        let clock = ManualClock::new(0.0);
        let storage: Arc<dyn Storage> =
            Arc::new(MemoryStorage::with_clock(100, Arc::new(clock.clone())));
        let first = TokenBucket::new(3.0, 1.0, storage.clone()).with_clock(Arc::new(clock.clone()));
        let second = TokenBucket::new(3.0, 1.0, storage).with_clock(Arc::new(clock.clone()));

        assert!(first.acquire("k", 2.0).await.unwrap());
        assert!(second.acquire_one("k").await.unwrap());
        assert!(!first.acquire_one("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_idle_state_expires_to_full_bucket() {
        let clock = ManualClock::new(0.0);
        let storage = Arc::new(MemoryStorage::with_clock(100, Arc::new(clock.clone())));
        let limiter = TokenBucket::new(4.0, 2.0, storage.clone()).with_clock(Arc::new(clock.clone()));

        assert!(limiter.acquire("k", 4.0).await.unwrap());
        assert!(storage.exists("default:k").await.unwrap());

        clock.advance(Duration::from_secs(10));
        assert!(!storage.exists("default:k").await.unwrap());
        assert!(limiter.acquire("k", 4.0).await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_state_resets_bucket() {
        let (limiter, _clock) = bucket(2.0, 1.0);

        assert!(limiter.acquire("k", 2.0).await.unwrap());
        limiter
            .storage
            .set("default:k", Value::from("not json"), None)
            .await
            .unwrap();

        assert!(limiter.acquire("k", 2.0).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_acquires_never_overadmit() {
        let (limiter, _clock) = bucket(20.0, 1.0);
        let limiter = Arc::new(limiter);

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.acquire_one("shared").await.unwrap() })
            })
            .collect();

        let admitted = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(admitted, 20);
    }

    #[tokio::test]
    async fn test_stats_for_unknown_key_is_full() {
        let (limiter, clock) = bucket(5.0, 2.0);

        match limiter.get_stats("fresh").await.unwrap() {
            LimiterStats::TokenBucket {
                available_tokens,
                max_tokens,
                refill_rate,
                last_update,
            } => {
                assert_eq!(available_tokens, 5.0);
                assert_eq!(max_tokens, 5.0);
                assert_eq!(refill_rate, 2.5);
                assert_eq!(last_update, clock.now());
            }
            other => panic!("unexpected stats: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fast_bucket_admits_burst_then_refills() {
        let clock = ManualClock::new(0.0);
        let limiter = FastTokenBucket::new(5.0, 1.0).with_clock(Arc::new(clock.clone()));

        let mut admitted = 0;
        for _ in 0..10 {
            if limiter.acquire_one("k").await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);

        clock.advance(Duration::from_millis(500));
        assert!(limiter.acquire("k", 2.0).await.unwrap());
        assert!(!limiter.acquire_one("k").await.unwrap());
        assert_eq!(limiter.bucket_count(), 1);
    }

    #[tokio::test]
    async fn test_fast_bucket_release() {
        let clock = ManualClock::new(0.0);
        let limiter = FastTokenBucket::new(4.0, 1.0)
            .with_burst(4.0)
            .with_clock(Arc::new(clock.clone()));

        // Releasing an unknown key creates nothing.
        limiter.release("ghost", 1.0).await.unwrap();
        assert_eq!(limiter.bucket_count(), 0);

        assert!(limiter.acquire("k", 4.0).await.unwrap());
        limiter.release("k", 1.0).await.unwrap();
        assert!(limiter.acquire_one("k").await.unwrap());
        assert!(!limiter.acquire_one("k").await.unwrap());

        limiter.release("k", 10.0).await.unwrap();
        assert_eq!(limiter.get_stats("k").await.unwrap().available(), 4.0);
    }

    #[tokio::test]
    async fn test_rejects_invalid_token_amounts() {
        let (limiter, _clock) = bucket(5.0, 1.0);

        assert!(limiter.acquire("k", 1.0).await.unwrap());
        assert_err!(limiter.release("k", -40.0).await);
        assert_err!(limiter.acquire("k", -3.0).await);
        assert_err!(limiter.acquire("k", f64::INFINITY).await);

        assert_eq!(limiter.get_stats("k").await.unwrap().available(), 4.0);
    }

    #[tokio::test]
    async fn test_fast_bucket_rejects_invalid_token_amounts() {
        let clock = ManualClock::new(0.0);
        let limiter = FastTokenBucket::new(5.0, 1.0).with_clock(Arc::new(clock.clone()));

        assert!(limiter.acquire("k", 2.0).await.unwrap());
        assert_err!(limiter.release("k", -40.0).await);
        assert_err!(limiter.acquire("k", f64::NAN).await);

        assert_eq!(limiter.get_stats("k").await.unwrap().available(), 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_acquire_leaves_state_intact() {
        init_tracing();
        let clock = ManualClock::new(0.0);
        let storage = Arc::new(StallingStorage::new(MemoryStorage::with_clock(
            100,
            Arc::new(clock.clone()),
        )));
        let limiter = TokenBucket::new(5.0, 1.0, storage.clone()).with_clock(Arc::new(clock.clone()));

        assert!(limiter.acquire("k", 2.0).await.unwrap());
        let before = storage.inner().get("default:k").await.unwrap();

        storage.stall_writes(true);
        clock.advance(Duration::from_millis(500));
        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), limiter.acquire("k", 1.0)).await;
        assert!(abandoned.is_err());

        assert_eq!(storage.inner().get("default:k").await.unwrap(), before);
        let relock = tokio::time::timeout(Duration::from_millis(50), limiter.locks.lock("default:k"));
        drop(assert_ok!(relock.await));

        // Refill is computed from the last committed record.
        storage.stall_writes(false);
        assert!(limiter.acquire("k", 3.0).await.unwrap());
        assert_eq!(limiter.get_stats("k").await.unwrap().available(), 2.0);
    }

    #[tokio::test]
    async fn test_fast_bucket_purges_full_buckets() {
        let clock = ManualClock::new(0.0);
        let limiter = FastTokenBucket::new(2.0, 1.0).with_clock(Arc::new(clock.clone()));

        assert!(limiter.acquire("old", 2.0).await.unwrap());
        clock.advance(Duration::from_secs(1));
        assert!(limiter.acquire_one("new").await.unwrap());

        assert_eq!(limiter.purge_idle(), 1);
        assert_eq!(limiter.bucket_count(), 1);
        assert_eq!(limiter.get_stats("old").await.unwrap().available(), 2.0);
    }
}
