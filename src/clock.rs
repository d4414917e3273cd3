//! Time sources shared by all limiters, storages and breakers.
//!
//! Every algorithm in this crate reads time through [`Clock`] as floating
//! point seconds. Production code uses [`SystemClock`]; tests and simulations
//! use [`ManualClock`] and advance it explicitly instead of sleeping.

use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Source of the current time, in seconds.
pub trait Clock: Send + Sync + Debug {
    /// Get the current time in seconds.
    fn now(&self) -> f64;
}

/// Wall clock backed by `chrono::Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self
    }

    /// Shareable handle to the system clock.
    pub fn shared() -> Arc<dyn Clock> {
        Arc::new(Self)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
    }
}

/// Manually driven clock.
///
/// Clones share the same underlying time, so a clock handed to a limiter can
/// be advanced from the test that owns it.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    current: Arc<Mutex<f64>>,
}

impl ManualClock {
    /// Create a clock reading `start` seconds.
    pub fn new(start: f64) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    /// Advance the clock by a duration.
    pub fn advance(&self, by: Duration) {
        *self.current.lock() += by.as_secs_f64();
    }

    /// Set the clock to an absolute reading.
    pub fn set(&self, seconds: f64) {
        *self.current.lock() = seconds;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.current.lock()
    }
}

/// Shortest period accepted by background tick tasks.
pub(crate) const MIN_TICK: Duration = Duration::from_millis(1);

/// Tokio interval for a background tick task.
///
/// `tokio::time::interval` panics on a zero period; shorter periods are
/// raised to [`MIN_TICK`].
pub(crate) fn tick_interval(every: Duration) -> tokio::time::Interval {
    tokio::time::interval(every.max(MIN_TICK))
}
