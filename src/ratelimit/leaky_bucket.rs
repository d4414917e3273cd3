//! Leaky bucket limiter.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::backend::Limiter;
use super::locks::{KeyLocks, DEFAULT_LOCK_SHARDS};
use super::state::{self, Snapshot};
use super::stats::LimiterStats;
use super::{check_tokens, scoped_key, DEFAULT_SCOPE};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::storage::Storage;

/// Storage-backed leaky bucket.
///
/// Each key accumulates a level that drains at `rate` units per second. A
/// request of `tokens` fits when the drained level plus `tokens` stays within
/// `capacity`. The drained level is written back on every attempt, so the
/// drain clock keeps moving even while requests are refused.
#[derive(Debug)]
pub struct LeakyBucket {
    rate: f64,
    capacity: f64,
    scope: String,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    locks: KeyLocks,
}

impl LeakyBucket {
    pub fn new(rate: f64, capacity: f64, storage: Arc<dyn Storage>) -> Self {
        Self {
            rate,
            capacity,
            scope: DEFAULT_SCOPE.to_string(),
            storage,
            clock: SystemClock::shared(),
            locks: KeyLocks::new(DEFAULT_LOCK_SHARDS),
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_lock_shards(mut self, shards: usize) -> Self {
        self.locks = KeyLocks::new(shards);
        self
    }

    /// Drain rate in units per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    fn drained(&self, stored: Option<Snapshot>, now: f64) -> f64 {
        match stored {
            None => 0.0,
            Some(s) => {
                let elapsed = (now - s.updated_at).max(0.0);
                (s.value - elapsed * self.rate).max(0.0)
            }
        }
    }

    fn idle_ttl(&self) -> Option<Duration> {
        state::idle_ttl(self.capacity / self.rate)
    }
}

#[async_trait]
impl Limiter for LeakyBucket {
    async fn acquire(&self, key: &str, tokens: f64) -> Result<bool> {
        check_tokens(tokens)?;
        let key = scoped_key(&self.scope, key);
        let _guard = self.locks.lock(&key).await;

        let now = self.clock.now();
        let stored = state::load(self.storage.as_ref(), &key).await?;
        let level = self.drained(stored, now);

        let admitted = level + tokens <= self.capacity;
        let new_level = if admitted { level + tokens } else { level };

        state::store(
            self.storage.as_ref(),
            &key,
            Snapshot {
                value: new_level,
                updated_at: now,
            },
            self.idle_ttl(),
        )
        .await?;

        if admitted {
            trace!(key = %key, tokens, level = new_level, "Leaky bucket admitted request");
        } else {
            debug!(key = %key, tokens, level, capacity = self.capacity, "Leaky bucket rejected request");
        }
        Ok(admitted)
    }

    async fn release(&self, key: &str, tokens: f64) -> Result<()> {
        check_tokens(tokens)?;
        let key = scoped_key(&self.scope, key);
        let _guard = self.locks.lock(&key).await;

        // Only the level moves; the drain clock stays where it was.
        let Some(stored) = state::load(self.storage.as_ref(), &key).await? else {
            return Ok(());
        };

        state::store(
            self.storage.as_ref(),
            &key,
            Snapshot {
                value: (stored.value - tokens).max(0.0),
                updated_at: stored.updated_at,
            },
            self.idle_ttl(),
        )
        .await
    }

    async fn get_stats(&self, key: &str) -> Result<LimiterStats> {
        let key = scoped_key(&self.scope, key);
        let now = self.clock.now();
        let stored = state::load(self.storage.as_ref(), &key).await?;

        Ok(LimiterStats::LeakyBucket {
            current_level: self.drained(stored, now),
            capacity: self.capacity,
            leak_rate: self.rate,
            last_update: stored.map_or(now, |s| s.updated_at),
        })
    }
}
