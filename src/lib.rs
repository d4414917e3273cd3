//! Fluxguard - Admission Control and Failure Isolation
//!
//! This crate decides, per logical key, whether an action may proceed right
//! now, and isolates callers from a persistently failing dependency. Rate
//! limiters share one [`Limiter`] trait and persist their state through a
//! pluggable [`Storage`] (in-process, Redis, or a two-tier combination).
//! A [`CircuitBreaker`] wraps arbitrary async calls independently of limiting.
//!
//! ```no_run
//! use std::sync::Arc;
//! use fluxguard::{Limiter, MemoryStorage, TokenBucket};
//!
//! # async fn example() -> fluxguard::Result<()> {
//! let storage = Arc::new(MemoryStorage::default());
//! let limiter = TokenBucket::new(5.0, 1.0, storage).with_scope("api");
//!
//! if limiter.acquire_one("user-42").await? {
//!     // proceed
//! }
//! # Ok(())
//! # }
//! ```

pub mod breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod registry;
pub mod storage;

#[cfg(test)]
mod testing;

pub use breaker::{BreakerState, CircuitBreaker, CircuitBreakerConfig};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::FluxguardConfig;
pub use error::{BreakerError, FluxError, Result};
pub use ratelimit::{
    AdaptiveConfig, AdaptiveLimiter, CompositeLimiter, FastTokenBucket, LeakyBucket, Limiter,
    LimiterStats, PurgeIdle, RedisSlidingWindow, SlidingWindow, TokenBucket,
};
pub use registry::Registry;
pub use storage::{HybridStorage, MemoryStorage, RedisStorage, Storage, Value};
