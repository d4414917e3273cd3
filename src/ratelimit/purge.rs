//! Background cleanup for in-process limiters.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::clock::tick_interval;

/// A limiter holding per-key state in process memory.
///
/// Keys whose state has returned to its initial value carry no information
/// and can be dropped without changing any later decision.
pub trait PurgeIdle: Send + Sync {
    /// Drop idle keys. Returns the number removed.
    fn purge_idle(&self) -> usize;
}

/// Run [`PurgeIdle::purge_idle`] on `limiter` every `every`.
///
/// Abort the returned handle to stop. Periods below one millisecond are
/// raised to one millisecond.
pub fn spawn_purger<L>(limiter: Arc<L>, every: Duration) -> JoinHandle<()>
where
    L: PurgeIdle + ?Sized + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tick_interval(every);
        loop {
            ticker.tick().await;
            let removed = limiter.purge_idle();
            if removed > 0 {
                trace!(removed, "Purged idle limiter keys");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::{FastTokenBucket, Limiter, SlidingWindow};

    #[tokio::test(start_paused = true)]
    async fn test_purger_drops_idle_windows() {
        let clock = ManualClock::new(0.0);
        let limiter = Arc::new(SlidingWindow::new(2.0, 1.0).with_clock(Arc::new(clock.clone())));
        limiter.acquire_one("a").await.unwrap();
        limiter.acquire_one("b").await.unwrap();
        assert_eq!(limiter.key_count(), 2);

        let handle = spawn_purger(limiter.clone(), Duration::from_secs(1));
        clock.advance(Duration::from_secs(2));
        tokio::time::sleep(Duration::from_secs(2)).await;
        handle.abort();

        assert_eq!(limiter.key_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purger_accepts_trait_objects() {
        let clock = ManualClock::new(0.0);
        let bucket = Arc::new(FastTokenBucket::new(1.0, 1.0).with_clock(Arc::new(clock.clone())));
        bucket.acquire_one("k").await.unwrap();

        let purgeable: Arc<dyn PurgeIdle> = bucket.clone();
        let handle = spawn_purger(purgeable, Duration::ZERO);
        clock.advance(Duration::from_secs(5));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(!handle.is_finished());
        assert_eq!(bucket.bucket_count(), 0);
        handle.abort();
    }
}
