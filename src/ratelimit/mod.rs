//! Rate limiting algorithms and per-key state management.
//!
//! Every algorithm implements [`Limiter`]. Keys are namespaced by a scope,
//! so one store can hold state for several independent limiters.

mod adaptive;
mod backend;
mod composite;
mod leaky_bucket;
mod locks;
mod purge;
mod sliding_window;
mod state;
mod stats;
mod token_bucket;

pub use adaptive::{spawn_adjuster, AdaptiveConfig, AdaptiveLimiter};
pub use backend::Limiter;
pub use composite::CompositeLimiter;
pub use leaky_bucket::LeakyBucket;
pub use locks::{KeyLocks, DEFAULT_LOCK_SHARDS};
pub use purge::{spawn_purger, PurgeIdle};
pub use sliding_window::{RedisSlidingWindow, SlidingWindow};
pub use stats::LimiterStats;
pub use token_bucket::{FastTokenBucket, TokenBucket};

use crate::error::{FluxError, Result};

/// Scope used when none is configured.
pub const DEFAULT_SCOPE: &str = "default";

/// Composite key identifying one independent piece of limiter state.
pub(crate) fn scoped_key(scope: &str, key: &str) -> String {
    format!("{}:{}", scope, key)
}

/// Token amounts must be finite and non-negative, or bucket bounds break.
pub(crate) fn check_tokens(tokens: f64) -> Result<()> {
    if tokens.is_finite() && tokens >= 0.0 {
        Ok(())
    } else {
        Err(FluxError::Config(format!(
            "token amount must be finite and non-negative, got {}",
            tokens
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_tokens() {
        assert!(check_tokens(0.0).is_ok());
        assert!(check_tokens(2.5).is_ok());
        assert!(matches!(check_tokens(-1.0), Err(FluxError::Config(_))));
        assert!(check_tokens(f64::NAN).is_err());
        assert!(check_tokens(f64::INFINITY).is_err());
    }
}
