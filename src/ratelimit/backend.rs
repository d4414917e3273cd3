//! Limiter trait shared by every admission-control algorithm.

use async_trait::async_trait;
use std::fmt;

use super::stats::LimiterStats;
use crate::error::Result;

/// Trait for rate limiter implementations.
///
/// Callers hold limiters as `Arc<dyn Limiter>` and never branch on the
/// concrete algorithm. A refused request is `Ok(false)`; `Err` means the
/// decision could not be made (for example the backing store is down).
#[async_trait]
pub trait Limiter: Send + Sync + fmt::Debug {
    /// Try to take `tokens` for `key`. Returns `true` if admitted.
    async fn acquire(&self, key: &str, tokens: f64) -> Result<bool>;

    /// Give `tokens` back for `key`. Algorithms without a returnable
    /// resource treat this as a no-op.
    async fn release(&self, key: &str, tokens: f64) -> Result<()>;

    /// Snapshot of the limiter's state for `key`.
    async fn get_stats(&self, key: &str) -> Result<LimiterStats>;

    /// Try to take a single token for `key`.
    async fn acquire_one(&self, key: &str) -> Result<bool> {
        self.acquire(key, 1.0).await
    }
}
