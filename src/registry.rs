//! Named limiters and breakers built from configuration.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::breaker::CircuitBreaker;
use crate::clock::{Clock, SystemClock};
use crate::config::{FluxguardConfig, LimiterConfig, StorageConfig};
use crate::error::{FluxError, Result};
use crate::ratelimit::{
    AdaptiveLimiter, CompositeLimiter, FastTokenBucket, LeakyBucket, Limiter, RedisSlidingWindow,
    SlidingWindow, TokenBucket,
};
use crate::storage::{HybridStorage, MemoryStorage, RedisStorage, RedisStorageConfig, Storage};

/// Limiters and circuit breakers addressed by name.
///
/// All storage-backed limiters share one storage handle, one clock and the
/// configured lock-shard count.
#[derive(Debug)]
pub struct Registry {
    storage: Arc<dyn Storage>,
    redis: Option<Arc<RedisStorage>>,
    clock: Arc<dyn Clock>,
    lock_shards: usize,
    limiters: HashMap<String, Arc<dyn Limiter>>,
    adaptive: HashMap<String, Arc<AdaptiveLimiter>>,
    breakers: HashMap<String, Arc<CircuitBreaker>>,
}

impl Registry {
    /// Validate `config`, connect its storage and build every limiter and breaker.
    pub async fn from_config(config: &FluxguardConfig) -> Result<Self> {
        Self::with_clock(config, SystemClock::shared()).await
    }

    /// Same as [`from_config`](Self::from_config), reading time from `clock`.
    pub async fn with_clock(config: &FluxguardConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let (storage, redis) = connect_storage(&config.storage, clock.clone()).await?;
        let mut registry = Self {
            storage,
            redis,
            clock,
            lock_shards: config.lock_shards,
            limiters: HashMap::new(),
            adaptive: HashMap::new(),
            breakers: HashMap::new(),
        };

        for (name, limiter_config) in &config.limiters {
            let limiter = match limiter_config.adaptive_config()? {
                Some(adaptive_config) => {
                    let adaptive =
                        Arc::new(AdaptiveLimiter::with_clock(adaptive_config, registry.clock.clone()));
                    registry.adaptive.insert(name.clone(), adaptive.clone());
                    adaptive as Arc<dyn Limiter>
                }
                None => registry.build_limiter(name, limiter_config)?,
            };
            registry.limiters.insert(name.clone(), limiter);
        }

        for (name, breaker_config) in &config.breakers {
            let breaker = CircuitBreaker::new(breaker_config.to_breaker_config()?)
                .with_name(name.clone())
                .with_clock(registry.clock.clone());
            registry.breakers.insert(name.clone(), Arc::new(breaker));
        }

        info!(
            limiters = registry.limiters.len(),
            breakers = registry.breakers.len(),
            "Built registry from configuration"
        );
        Ok(registry)
    }

    fn build_limiter(&self, scope: &str, config: &LimiterConfig) -> Result<Arc<dyn Limiter>> {
        let limiter: Arc<dyn Limiter> = match config {
            LimiterConfig::TokenBucket {
                rate,
                per,
                burst,
                scope: configured,
            } => Arc::new(
                TokenBucket::new(*rate, *per, self.storage.clone())
                    .with_burst(burst.unwrap_or(*rate))
                    .with_scope(configured.as_deref().unwrap_or(scope))
                    .with_clock(self.clock.clone())
                    .with_lock_shards(self.lock_shards),
            ),
            LimiterConfig::FastTokenBucket {
                rate,
                per,
                burst,
                scope: configured,
            } => Arc::new(
                FastTokenBucket::new(*rate, *per)
                    .with_burst(burst.unwrap_or(*rate))
                    .with_scope(configured.as_deref().unwrap_or(scope))
                    .with_clock(self.clock.clone()),
            ),
            LimiterConfig::SlidingWindow {
                rate,
                per,
                scope: configured,
            } => Arc::new(
                SlidingWindow::new(*rate, *per)
                    .with_scope(configured.as_deref().unwrap_or(scope))
                    .with_clock(self.clock.clone()),
            ),
            LimiterConfig::RedisSlidingWindow {
                rate,
                per,
                scope: configured,
            } => {
                let redis = self.redis.clone().ok_or_else(|| {
                    FluxError::Config(format!(
                        "limiter '{}': redis_sliding_window requires redis or hybrid storage",
                        scope
                    ))
                })?;
                Arc::new(
                    RedisSlidingWindow::new(*rate, *per, redis)
                        .with_scope(configured.as_deref().unwrap_or(scope))
                        .with_clock(self.clock.clone()),
                )
            }
            LimiterConfig::LeakyBucket {
                rate,
                capacity,
                scope: configured,
            } => Arc::new(
                LeakyBucket::new(*rate, *capacity, self.storage.clone())
                    .with_scope(configured.as_deref().unwrap_or(scope))
                    .with_clock(self.clock.clone())
                    .with_lock_shards(self.lock_shards),
            ),
            LimiterConfig::Adaptive { .. } => {
                let adaptive_config = config.adaptive_config()?.ok_or_else(|| {
                    FluxError::Config(format!("limiter '{}': invalid adaptive settings", scope))
                })?;
                Arc::new(AdaptiveLimiter::with_clock(adaptive_config, self.clock.clone()))
            }
            LimiterConfig::Composite {
                members,
                rollback_on_reject,
            } => {
                let members = members
                    .iter()
                    .enumerate()
                    .map(|(index, member)| self.build_limiter(&format!("{}.{}", scope, index), member))
                    .collect::<Result<Vec<_>>>()?;
                Arc::new(CompositeLimiter::new(members).with_rollback(*rollback_on_reject))
            }
        };
        Ok(limiter)
    }

    /// The limiter named `name`.
    pub fn limiter(&self, name: &str) -> Option<Arc<dyn Limiter>> {
        self.limiters.get(name).cloned()
    }

    /// The adaptive limiter named `name`, for reporting outcomes.
    pub fn adaptive(&self, name: &str) -> Option<Arc<AdaptiveLimiter>> {
        self.adaptive.get(name).cloned()
    }

    /// The circuit breaker named `name`.
    pub fn breaker(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).cloned()
    }

    /// The shared storage handle.
    pub fn storage(&self) -> Arc<dyn Storage> {
        self.storage.clone()
    }

    /// Names of all configured limiters, sorted.
    pub fn limiter_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.limiters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Names of all configured breakers, sorted.
    pub fn breaker_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.breakers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

async fn connect_storage(
    config: &StorageConfig,
    clock: Arc<dyn Clock>,
) -> Result<(Arc<dyn Storage>, Option<Arc<RedisStorage>>)> {
    match config {
        StorageConfig::Memory { capacity } => {
            let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::with_clock(*capacity, clock));
            Ok((storage, None))
        }
        StorageConfig::Redis { url, key_prefix } => {
            let redis_config = RedisStorageConfig {
                key_prefix: key_prefix.clone(),
            };
            let redis = Arc::new(RedisStorage::connect_with_config(url, redis_config).await?);
            let storage: Arc<dyn Storage> = redis.clone();
            Ok((storage, Some(redis)))
        }
        StorageConfig::Hybrid {
            url,
            key_prefix,
            fast_capacity,
        } => {
            let redis_config = RedisStorageConfig {
                key_prefix: key_prefix.clone(),
            };
            let durable = RedisStorage::connect_with_config(url, redis_config).await?;
            let redis = Arc::new(durable.clone());
            let fast = MemoryStorage::with_clock(*fast_capacity, clock);
            let storage: Arc<dyn Storage> = Arc::new(HybridStorage::new(fast, durable));
            Ok((storage, Some(redis)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::BreakerError;
    use crate::ratelimit::LimiterStats;
    use crate::testing::init_tracing;
    use std::time::Duration;

    const CONFIG: &str = r#"
lock_shards: 4
limiters:
  api:
    algorithm: token_bucket
    rate: 2
  jobs:
    algorithm: token_bucket
    rate: 2
  window:
    algorithm: sliding_window
    rate: 1
    per: 10
  drain:
    algorithm: leaky_bucket
    rate: 1
    capacity: 2
  tuned:
    algorithm: adaptive
    initial_rate: 10
    min_rate: 1
    window_secs: 5
  both:
    algorithm: composite
    members:
      - algorithm: fast_token_bucket
        rate: 5
      - algorithm: sliding_window
        rate: 1
        per: 60
breakers:
  payments:
    failure_threshold: 1
    timeout_secs: 5
"#;

    async fn registry() -> (Registry, ManualClock) {
        let clock = ManualClock::new(1_000.0);
        let config = FluxguardConfig::from_yaml(CONFIG).unwrap();
        let registry = Registry::with_clock(&config, Arc::new(clock.clone()))
            .await
            .unwrap();
        (registry, clock)
    }

    #[tokio::test]
    async fn test_builds_every_named_entry() {
        init_tracing();
        let (registry, _clock) = registry().await;

        assert_eq!(
            registry.limiter_names(),
            vec!["api", "both", "drain", "jobs", "tuned", "window"]
        );
        assert_eq!(registry.breaker_names(), vec!["payments"]);
        assert!(registry.limiter("missing").is_none());
        assert!(registry.adaptive("tuned").is_some());
        assert!(registry.adaptive("api").is_none());
    }

    #[tokio::test]
    async fn test_limiters_do_not_share_keys() {
        let (registry, _clock) = registry().await;
        let api = registry.limiter("api").unwrap();
        let jobs = registry.limiter("jobs").unwrap();

        assert!(api.acquire("user", 2.0).await.unwrap());
        assert!(!api.acquire_one("user").await.unwrap());
        assert!(jobs.acquire("user", 2.0).await.unwrap());

        assert!(registry.storage().exists("api:user").await.unwrap());
        assert!(registry.storage().exists("jobs:user").await.unwrap());
    }

    #[tokio::test]
    async fn test_limiters_follow_shared_clock() {
        let (registry, clock) = registry().await;
        let window = registry.limiter("window").unwrap();
        let drain = registry.limiter("drain").unwrap();

        assert!(window.acquire_one("k").await.unwrap());
        assert!(!window.acquire_one("k").await.unwrap());
        assert!(drain.acquire("k", 2.0).await.unwrap());
        assert!(!drain.acquire_one("k").await.unwrap());

        clock.advance(Duration::from_secs(11));
        assert!(window.acquire_one("k").await.unwrap());
        assert!(drain.acquire("k", 2.0).await.unwrap());
    }

    #[tokio::test]
    async fn test_composite_from_config() {
        let (registry, _clock) = registry().await;
        let both = registry.limiter("both").unwrap();

        assert!(both.acquire_one("k").await.unwrap());
        assert!(!both.acquire_one("k").await.unwrap());

        match both.get_stats("k").await.unwrap() {
            LimiterStats::Composite { limiters } => {
                assert_eq!(limiters.len(), 2);
                assert_eq!(limiters[0].available(), 3.0);
            }
            other => panic!("unexpected stats: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_adaptive_handle_is_the_registered_limiter() {
        let (registry, _clock) = registry().await;
        let tuned = registry.adaptive("tuned").unwrap();

        tuned.report_error();
        assert_eq!(tuned.current_rate(), 5.0);

        let stats = registry.limiter("tuned").unwrap().get_stats("k").await.unwrap();
        assert_eq!(stats.rate(), 5.0);
    }

    #[tokio::test]
    async fn test_breaker_from_config() {
        let (registry, clock) = registry().await;
        let breaker = registry.breaker("payments").unwrap();
        assert_eq!(breaker.name(), "payments");

        let failed: std::result::Result<(), BreakerError<anyhow::Error>> =
            breaker.call(|| async { Err(anyhow::anyhow!("declined")) }).await;
        assert!(!failed.unwrap_err().is_open());

        let rejected = breaker.call(|| async { Ok::<_, anyhow::Error>(()) }).await;
        assert!(rejected.unwrap_err().is_open());

        clock.advance(Duration::from_secs(6));
        assert!(breaker.call(|| async { Ok::<_, anyhow::Error>(()) }).await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = FluxguardConfig::from_yaml(
            "limiters: {shared: {algorithm: redis_sliding_window, rate: 5}}",
        )
        .unwrap();

        let err = Registry::from_config(&config).await.unwrap_err();
        assert!(matches!(err, FluxError::Config(_)));
    }
}
