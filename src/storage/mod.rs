//! Key/value storage with TTL expiry and atomic numeric increment.
//!
//! Limiters persist their per-key state through [`Storage`]. Three backends
//! are provided: an in-process map ([`MemoryStorage`]), a remote Redis store
//! ([`RedisStorage`]) and a two-tier combination of both ([`HybridStorage`]).

mod hybrid;
mod memory;
mod redis_store;
mod value;

use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;

use crate::error::Result;

pub use self::hybrid::{HybridStorage, FAST_TIER_TTL};
pub use self::memory::{spawn_sweeper, MemoryStorage, DEFAULT_MEMORY_CAPACITY};
pub use self::redis_store::{RedisStorage, RedisStorageConfig};
pub use self::value::Value;

/// Trait for storage backends.
///
/// Expired entries are logically absent: `get` and `exists` never report
/// them, and `incr` on an expired key starts from zero. `incr` must be atomic
/// with respect to concurrent callers on the same key.
#[async_trait]
pub trait Storage: Send + Sync + Debug {
    /// Fetch the value stored at `key`.
    ///
    /// String-only backends may return numeric text as a number; see
    /// [`RedisStorage`].
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Store `value` at `key`, optionally expiring after `ttl`.
    ///
    /// A zero `ttl` is treated as no expiry. Writing without a `ttl` clears
    /// any expiry previously set on the key.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()>;

    /// Atomically add `delta` to the number at `key` and return the result.
    async fn incr(&self, key: &str, delta: f64) -> Result<f64>;

    /// Atomically subtract `delta` from the number at `key`.
    async fn decr(&self, key: &str, delta: f64) -> Result<f64> {
        self.incr(key, -delta).await
    }

    /// Remove `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Check whether a live value is stored at `key`.
    async fn exists(&self, key: &str) -> Result<bool>;
}

/// Drop zero-length TTLs so every backend agrees on "no expiry".
pub(crate) fn effective_ttl(ttl: Option<Duration>) -> Option<Duration> {
    ttl.filter(|t| !t.is_zero())
}
