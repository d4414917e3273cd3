//! Adaptive (AIMD) rate limiter.
//!
//! Admission is a token bucket whose rate tunes itself: every `window`
//! seconds the ratio of refused to total outcomes is examined, and the rate
//! is cut multiplicatively when it exceeds `error_threshold` or raised by a
//! fixed step otherwise.
//!
//! The limiter keeps one global state. The key passed to [`Limiter`] methods
//! is accepted for interface compatibility and does not partition anything.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::backend::Limiter;
use super::stats::LimiterStats;
use super::check_tokens;
use crate::clock::{tick_interval, Clock, SystemClock};
use crate::error::Result;

/// Tuning parameters for [`AdaptiveLimiter`].
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveConfig {
    /// Starting rate in tokens per second
    pub initial_rate: f64,
    pub min_rate: f64,
    pub max_rate: f64,
    /// Added to the rate after a healthy window
    pub increase_step: f64,
    /// Multiplied into the rate after an unhealthy window
    pub decrease_factor: f64,
    /// Error ratio above which a window counts as unhealthy
    pub error_threshold: f64,
    /// Minimum time between two adjustments
    pub window: Duration,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            initial_rate: 100.0,
            min_rate: 10.0,
            max_rate: 1000.0,
            increase_step: 1.0,
            decrease_factor: 0.5,
            error_threshold: 0.1,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct AdaptiveState {
    current_rate: f64,
    tokens: f64,
    last_refill: f64,
    success_count: u64,
    error_count: u64,
    last_adjust: f64,
}

impl AdaptiveState {
    fn refilled(&self, now: f64) -> f64 {
        let elapsed = (now - self.last_refill).max(0.0);
        self.current_rate.min(self.tokens + elapsed * self.current_rate)
    }
}

/// Self-tuning limiter following additive-increase/multiplicative-decrease.
#[derive(Debug)]
pub struct AdaptiveLimiter {
    config: AdaptiveConfig,
    state: Mutex<AdaptiveState>,
    clock: Arc<dyn Clock>,
}

impl AdaptiveLimiter {
    pub fn new(config: AdaptiveConfig) -> Self {
        Self::with_clock(config, SystemClock::shared())
    }

    /// Build a limiter reading time from `clock`.
    ///
    /// The first adjustment check is eligible immediately.
    pub fn with_clock(config: AdaptiveConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        let state = AdaptiveState {
            current_rate: config.initial_rate,
            tokens: config.initial_rate,
            last_refill: now,
            success_count: 0,
            error_count: 0,
            last_adjust: now - config.window.as_secs_f64(),
        };
        Self {
            config,
            state: Mutex::new(state),
            clock,
        }
    }

    pub fn config(&self) -> &AdaptiveConfig {
        &self.config
    }

    /// Rate currently enforced, in tokens per second.
    pub fn current_rate(&self) -> f64 {
        self.state.lock().current_rate
    }

    /// Record a successful downstream outcome.
    pub fn report_success(&self) {
        let mut state = self.state.lock();
        state.success_count += 1;
        self.adjust(&mut state, self.clock.now());
    }

    /// Record a failed downstream outcome.
    pub fn report_error(&self) {
        let mut state = self.state.lock();
        state.error_count += 1;
        self.adjust(&mut state, self.clock.now());
    }

    /// Run the throttled adjustment check without recording an outcome.
    pub fn tick(&self) {
        let mut state = self.state.lock();
        self.adjust(&mut state, self.clock.now());
    }

    fn adjust(&self, state: &mut AdaptiveState, now: f64) {
        if now - state.last_adjust < self.config.window.as_secs_f64() {
            return;
        }

        let total = state.success_count + state.error_count;
        if total == 0 {
            return;
        }

        let error_rate = state.error_count as f64 / total as f64;
        let previous = state.current_rate;
        state.current_rate = if error_rate > self.config.error_threshold {
            self.config
                .min_rate
                .max(state.current_rate * self.config.decrease_factor)
        } else {
            self.config
                .max_rate
                .min(state.current_rate + self.config.increase_step)
        };

        debug!(
            error_rate,
            previous,
            current = state.current_rate,
            "Adaptive limiter adjusted rate"
        );

        state.success_count = 0;
        state.error_count = 0;
        state.last_adjust = now;
    }
}

/// Run [`AdaptiveLimiter::tick`] every `every` on the tokio timer.
///
/// Rates keep adapting through idle periods that see no `acquire` calls.
/// Abort the returned handle to stop. Periods below one millisecond are
/// raised to one millisecond.
pub fn spawn_adjuster(limiter: Arc<AdaptiveLimiter>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tick_interval(every);
        loop {
            interval.tick().await;
            limiter.tick();
        }
    })
}

#[async_trait]
impl Limiter for AdaptiveLimiter {
    async fn acquire(&self, _key: &str, tokens: f64) -> Result<bool> {
        check_tokens(tokens)?;
        let now = self.clock.now();
        let mut state = self.state.lock();

        state.tokens = state.refilled(now);
        state.last_refill = now;

        let admitted = state.tokens >= tokens;
        if admitted {
            state.tokens -= tokens;
            state.success_count += 1;
            trace!(tokens, remaining = state.tokens, "Adaptive limiter admitted request");
        } else {
            state.error_count += 1;
            debug!(tokens, available = state.tokens, rate = state.current_rate, "Adaptive limiter rejected request");
        }

        self.adjust(&mut state, now);
        Ok(admitted)
    }

    async fn release(&self, _key: &str, tokens: f64) -> Result<()> {
        check_tokens(tokens)?;
        let mut state = self.state.lock();
        state.tokens = state.current_rate.min(state.tokens + tokens);
        Ok(())
    }

    async fn get_stats(&self, _key: &str) -> Result<LimiterStats> {
        let now = self.clock.now();
        let state = self.state.lock();

        Ok(LimiterStats::Adaptive {
            current_rate: state.current_rate,
            min_rate: self.config.min_rate,
            max_rate: self.config.max_rate,
            available_tokens: state.refilled(now),
            success_count: state.success_count,
            error_count: state.error_count,
        })
    }
}
