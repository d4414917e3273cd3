//! Circuit breaker isolating callers from a failing dependency.
//!
//! A breaker counts consecutive failures of the calls it wraps. Once the
//! count reaches the threshold it opens and rejects calls without running
//! them. After the timeout the next call is let through as a single trial:
//! success closes the breaker, failure opens it again.

use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use crate::clock::{Clock, SystemClock};
use crate::error::BreakerError;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls pass through and failures are counted
    Closed,
    /// Calls are rejected without being invoked
    Open,
    /// One trial call is allowed through
    HalfOpen,
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open after the last failure
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failures: u32,
    last_failure_at: f64,
    trial_in_flight: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    /// An error that does not count against the dependency
    Ignored,
}

/// Failure-isolation state machine wrapping async calls.
///
/// State transitions happen under a short internal lock; the wrapped call
/// runs outside it, so a slow call never blocks other callers' checks.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            name: "default".to_string(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                last_failure_at: 0.0,
                trial_in_flight: false,
            }),
            clock: SystemClock::shared(),
        }
    }

    /// Name used in log records.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Read time from `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state.
    ///
    /// An open breaker whose timeout has passed still reports `Open` until
    /// the next call moves it to half-open.
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Consecutive failures counted so far.
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failures
    }

    /// Force the breaker back to closed with a clean counter.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = BreakerState::Closed;
        inner.failures = 0;
        inner.trial_in_flight = false;
        debug!(breaker = %self.name, "Circuit breaker reset");
    }

    /// Run `f` through the breaker, counting every `Err` as a failure.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_matching(f, |_| true).await
    }

    /// Run `f` through the breaker, counting only errors for which
    /// `is_failure` holds.
    ///
    /// Other errors are returned to the caller without touching the
    /// breaker's state.
    pub async fn call_matching<F, Fut, T, E, P>(
        &self,
        f: F,
        is_failure: P,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        let permit = self.admit().ok_or(BreakerError::Open)?;

        match f().await {
            Ok(value) => {
                permit.settle(Outcome::Success);
                Ok(value)
            }
            Err(e) => {
                let outcome = if is_failure(&e) {
                    Outcome::Failure
                } else {
                    Outcome::Ignored
                };
                permit.settle(outcome);
                Err(BreakerError::Inner(e))
            }
        }
    }

    fn admit(&self) -> Option<Permit<'_>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let now = self.clock.now();

        match inner.state {
            BreakerState::Closed => Some(Permit::new(self, false)),
            BreakerState::Open => {
                if now - inner.last_failure_at > self.config.timeout.as_secs_f64() {
                    inner.state = BreakerState::HalfOpen;
                    inner.failures = 0;
                    inner.trial_in_flight = true;
                    debug!(breaker = %self.name, "Circuit breaker half-open, sending trial call");
                    Some(Permit::new(self, true))
                } else {
                    trace!(breaker = %self.name, "Circuit breaker open, rejecting call");
                    None
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    trace!(breaker = %self.name, "Trial call in flight, rejecting call");
                    None
                } else {
                    inner.trial_in_flight = true;
                    Some(Permit::new(self, true))
                }
            }
        }
    }

    fn record(&self, outcome: Outcome, trial: bool) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let now = self.clock.now();

        if trial {
            inner.trial_in_flight = false;
        }

        // Only the trial decides how a half-open breaker moves on.
        if inner.state == BreakerState::HalfOpen && !trial {
            return;
        }

        match outcome {
            Outcome::Ignored => {}
            Outcome::Success => {
                if inner.state == BreakerState::HalfOpen {
                    debug!(breaker = %self.name, "Trial call succeeded, circuit closed");
                    inner.state = BreakerState::Closed;
                }
                if inner.state == BreakerState::Closed {
                    inner.failures = 0;
                }
            }
            Outcome::Failure => {
                inner.failures += 1;
                inner.last_failure_at = now;

                match inner.state {
                    BreakerState::HalfOpen => {
                        debug!(breaker = %self.name, "Trial call failed, circuit reopened");
                        inner.state = BreakerState::Open;
                    }
                    BreakerState::Closed if inner.failures >= self.config.failure_threshold => {
                        debug!(
                            breaker = %self.name,
                            failures = inner.failures,
                            "Failure threshold reached, circuit opened"
                        );
                        inner.state = BreakerState::Open;
                    }
                    _ => {}
                }
            }
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

/// Admission for one wrapped call.
///
/// Dropping an unsettled trial permit (the caller's future was cancelled)
/// frees the trial slot so the next call can try again.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    fn settle(mut self, outcome: Outcome) {
        self.settled = true;
        self.breaker.record(outcome, self.trial);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.inner.lock().trial_in_flight = false;
        }
    }
}
