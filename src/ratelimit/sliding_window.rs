//! Sliding window log limiters.
//!
//! Each key keeps the timestamps of its admitted events. An event is
//! admitted while fewer than `rate` timestamps fall inside the trailing
//! `per`-second window. The requested token amount does not matter here:
//! one admission is one event.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::Script;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace};

use super::backend::Limiter;
use super::purge::PurgeIdle;
use super::stats::LimiterStats;
use super::{check_tokens, scoped_key, DEFAULT_SCOPE};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::storage::{RedisStorage, Value};

/// Trim, count and conditionally insert in one atomic step.
///
/// ARGV: cutoff, now, rate, member, expire seconds.
const ACQUIRE_SCRIPT: &str = r"
local key = KEYS[1]
redis.call('ZREMRANGEBYSCORE', key, '-inf', '(' .. ARGV[1])
local count = redis.call('ZCARD', key)
if count < tonumber(ARGV[3]) then
    redis.call('ZADD', key, ARGV[2], ARGV[4])
    redis.call('EXPIRE', key, ARGV[5])
    return 1
end
return 0
";

/// Count events inside the window. ARGV: cutoff.
const COUNT_SCRIPT: &str = r"
return redis.call('ZCOUNT', KEYS[1], ARGV[1], '+inf')
";

/// In-process sliding window.
///
/// Windows live in a sharded concurrent map; each key's trim/count/insert
/// runs under that key's shard lock.
#[derive(Debug)]
pub struct SlidingWindow {
    rate: f64,
    per: f64,
    scope: String,
    windows: DashMap<String, VecDeque<f64>>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindow {
    /// Admit at most `rate` events per `per` seconds.
    pub fn new(rate: f64, per: f64) -> Self {
        Self {
            rate,
            per,
            scope: DEFAULT_SCOPE.to_string(),
            windows: DashMap::new(),
            clock: SystemClock::shared(),
        }
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

    /// Number of keys currently tracked.
    pub fn key_count(&self) -> usize {
        self.windows.len()
    }
}

impl PurgeIdle for SlidingWindow {
    /// Drop keys whose window has emptied.
    fn purge_idle(&self) -> usize {
        let cutoff = self.clock.now() - self.per;
        let before = self.windows.len();
        self.windows.retain(|_, window| {
            trim(window, cutoff);
            !window.is_empty()
        });
        before.saturating_sub(self.windows.len())
    }
}

/// Drop timestamps older than `cutoff` from a sorted window.
fn trim(window: &mut VecDeque<f64>, cutoff: f64) {
    while window.front().is_some_and(|&t| t < cutoff) {
        window.pop_front();
    }
}

#[async_trait]
impl Limiter for SlidingWindow {
    async fn acquire(&self, key: &str, tokens: f64) -> Result<bool> {
        check_tokens(tokens)?;
        let key = scoped_key(&self.scope, key);
        let now = self.clock.now();
        let cutoff = now - self.per;

        let mut window = self.windows.entry(key).or_default();
        trim(&mut window, cutoff);

        if (window.len() as f64) < self.rate {
            let at = window.partition_point(|&t| t <= now);
            window.insert(at, now);
            trace!(key = %window.key(), count = window.len(), "Sliding window admitted event");
            return Ok(true);
        }

        debug!(key = %window.key(), count = window.len(), "Sliding window rejected event");
        Ok(false)
    }

    async fn release(&self, _key: &str, tokens: f64) -> Result<()> {
        check_tokens(tokens)
    }

    async fn get_stats(&self, key: &str) -> Result<LimiterStats> {
        let key = scoped_key(&self.scope, key);
        let cutoff = self.clock.now() - self.per;
        let current_count = self
            .windows
            .get(&key)
            .map_or(0, |w| w.iter().filter(|&&t| t >= cutoff).count());

        Ok(window_stats(current_count, self.rate, self.per))
    }
}

fn window_stats(current_count: usize, rate: f64, per: f64) -> LimiterStats {
    LimiterStats::SlidingWindow {
        current_count,
        max_count: rate,
        window_seconds: per,
        available: (rate - current_count as f64).max(0.0),
    }
}

/// Sliding window shared across processes through Redis.
///
/// Each key is a sorted set of event timestamps. The trim/count/insert
/// sequence runs as one Lua script, so concurrent callers on different
/// hosts cannot both take the last slot.
#[derive(Debug)]
pub struct RedisSlidingWindow {
    rate: f64,
    per: f64,
    scope: String,
    storage: Arc<RedisStorage>,
    clock: Arc<dyn Clock>,
    acquire_script: Script,
    count_script: Script,
}

impl RedisSlidingWindow {
    /// Admit at most `rate` events per `per` seconds.
    pub fn new(rate: f64, per: f64, storage: Arc<RedisStorage>) -> Self {
        Self {
            rate,
            per,
            scope: DEFAULT_SCOPE.to_string(),
            storage,
            clock: SystemClock::shared(),
            acquire_script: Script::new(ACQUIRE_SCRIPT),
            count_script: Script::new(COUNT_SCRIPT),
        }
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

    /// Seconds an untouched window survives in Redis.
    fn expire_secs(&self) -> u64 {
        (self.per.ceil() as u64).max(1)
    }
}

#[async_trait]
impl Limiter for RedisSlidingWindow {
    async fn acquire(&self, key: &str, tokens: f64) -> Result<bool> {
        check_tokens(tokens)?;
        let key = scoped_key(&self.scope, key);
        let now = self.clock.now();
        let member = format!("{}-{}", now, uuid::Uuid::new_v4());

        let admitted: i64 = self
            .storage
            .eval_script(
                &self.acquire_script,
                &[&key],
                &[
                    Value::Number(now - self.per),
                    Value::Number(now),
                    Value::Number(self.rate),
                    Value::Text(member),
                    Value::Text(self.expire_secs().to_string()),
                ],
            )
            .await?;

        if admitted == 1 {
            trace!(key = %key, "Distributed sliding window admitted event");
            Ok(true)
        } else {
            debug!(key = %key, "Distributed sliding window rejected event");
            Ok(false)
        }
    }

    async fn release(&self, _key: &str, tokens: f64) -> Result<()> {
        check_tokens(tokens)
    }

    async fn get_stats(&self, key: &str) -> Result<LimiterStats> {
        let key = scoped_key(&self.scope, key);
        let cutoff = self.clock.now() - self.per;

        let count: i64 = self
            .storage
            .eval_script(&self.count_script, &[&key], &[Value::Number(cutoff)])
            .await?;

        Ok(window_stats(count.max(0) as usize, self.rate, self.per))
    }
}
