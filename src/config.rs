//! Configuration management for Fluxguard.
//!
//! A [`FluxguardConfig`] names the storage backend, the limiters and the
//! circuit breakers a [`Registry`](crate::registry::Registry) should build.
//!
//! ```yaml
//! storage:
//!   backend: memory
//!   capacity: 50000
//! limiters:
//!   api:
//!     algorithm: token_bucket
//!     rate: 100
//!     per: 60
//!   uploads:
//!     algorithm: composite
//!     members:
//!       - algorithm: sliding_window
//!         rate: 10
//!         per: 1
//!       - algorithm: leaky_bucket
//!         rate: 2
//!         capacity: 20
//! breakers:
//!   payments:
//!     failure_threshold: 3
//!     timeout_secs: 30
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::breaker::CircuitBreakerConfig;
use crate::error::{FluxError, Result};
use crate::ratelimit::{AdaptiveConfig, DEFAULT_LOCK_SHARDS};
use crate::storage::DEFAULT_MEMORY_CAPACITY;

/// Prefix of environment variables overriding file settings.
pub const ENV_PREFIX: &str = "FLUXGUARD";

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FluxguardConfig {
    /// Storage backend shared by all storage-backed limiters
    #[serde(default)]
    pub storage: StorageConfig,

    /// Number of per-key lock shards in each storage-backed limiter
    #[serde(default = "default_lock_shards")]
    pub lock_shards: usize,

    /// Named limiters
    #[serde(default)]
    pub limiters: HashMap<String, LimiterConfig>,

    /// Named circuit breakers
    #[serde(default)]
    pub breakers: HashMap<String, BreakerConfig>,
}

impl Default for FluxguardConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            lock_shards: default_lock_shards(),
            limiters: HashMap::new(),
            breakers: HashMap::new(),
        }
    }
}

fn default_lock_shards() -> usize {
    DEFAULT_LOCK_SHARDS
}

/// Storage backend selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    /// In-process map
    Memory {
        #[serde(default = "default_memory_capacity")]
        capacity: usize,
    },
    /// Remote Redis store
    Redis {
        url: String,
        #[serde(default)]
        key_prefix: String,
    },
    /// In-process cache in front of Redis
    Hybrid {
        url: String,
        #[serde(default)]
        key_prefix: String,
        #[serde(default = "default_fast_capacity")]
        fast_capacity: usize,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory {
            capacity: default_memory_capacity(),
        }
    }
}

impl StorageConfig {
    /// Whether the backend exposes a Redis connection.
    pub fn has_redis(&self) -> bool {
        !matches!(self, StorageConfig::Memory { .. })
    }
}

fn default_memory_capacity() -> usize {
    DEFAULT_MEMORY_CAPACITY
}

fn default_fast_capacity() -> usize {
    10_000
}

/// One limiter definition.
///
/// `scope` namespaces the limiter's keys; when omitted the registry uses
/// the limiter's name, so two limiters never share state by accident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum LimiterConfig {
    TokenBucket {
        rate: f64,
        #[serde(default = "default_per")]
        per: f64,
        /// Bucket capacity, defaults to `rate`
        #[serde(default)]
        burst: Option<f64>,
        #[serde(default)]
        scope: Option<String>,
    },
    FastTokenBucket {
        rate: f64,
        #[serde(default = "default_per")]
        per: f64,
        #[serde(default)]
        burst: Option<f64>,
        #[serde(default)]
        scope: Option<String>,
    },
    SlidingWindow {
        rate: f64,
        #[serde(default = "default_per")]
        per: f64,
        #[serde(default)]
        scope: Option<String>,
    },
    /// Sliding window evaluated atomically in Redis
    RedisSlidingWindow {
        rate: f64,
        #[serde(default = "default_per")]
        per: f64,
        #[serde(default)]
        scope: Option<String>,
    },
    LeakyBucket {
        /// Drain rate in units per second
        rate: f64,
        capacity: f64,
        #[serde(default)]
        scope: Option<String>,
    },
    Adaptive {
        #[serde(default = "default_initial_rate")]
        initial_rate: f64,
        #[serde(default = "default_min_rate")]
        min_rate: f64,
        #[serde(default = "default_max_rate")]
        max_rate: f64,
        #[serde(default = "default_increase_step")]
        increase_step: f64,
        #[serde(default = "default_decrease_factor")]
        decrease_factor: f64,
        #[serde(default = "default_error_threshold")]
        error_threshold: f64,
        #[serde(default = "default_window_secs")]
        window_secs: f64,
    },
    Composite {
        members: Vec<LimiterConfig>,
        /// Release earlier members' tokens when a later member rejects
        #[serde(default)]
        rollback_on_reject: bool,
    },
}

fn default_per() -> f64 {
    1.0
}

fn default_initial_rate() -> f64 {
    100.0
}

fn default_min_rate() -> f64 {
    10.0
}

fn default_max_rate() -> f64 {
    1000.0
}

fn default_increase_step() -> f64 {
    1.0
}

fn default_decrease_factor() -> f64 {
    0.5
}

fn default_error_threshold() -> f64 {
    0.1
}

fn default_window_secs() -> f64 {
    60.0
}

impl LimiterConfig {
    /// Whether this limiter, or any composite member, needs Redis.
    pub fn needs_redis(&self) -> bool {
        match self {
            LimiterConfig::RedisSlidingWindow { .. } => true,
            LimiterConfig::Composite { members, .. } => members.iter().any(Self::needs_redis),
            _ => false,
        }
    }

    /// Adaptive parameters, for the `adaptive` algorithm.
    pub fn adaptive_config(&self) -> Result<Option<AdaptiveConfig>> {
        let LimiterConfig::Adaptive {
            initial_rate,
            min_rate,
            max_rate,
            increase_step,
            decrease_factor,
            error_threshold,
            window_secs,
        } = self
        else {
            return Ok(None);
        };

        Ok(Some(AdaptiveConfig {
            initial_rate: *initial_rate,
            min_rate: *min_rate,
            max_rate: *max_rate,
            increase_step: *increase_step,
            decrease_factor: *decrease_factor,
            error_threshold: *error_threshold,
            window: seconds("window_secs", *window_secs)?,
        }))
    }

    fn validate(&self, name: &str) -> Result<()> {
        let fail = |msg: &str| Err(FluxError::Config(format!("limiter '{}': {}", name, msg)));

        match self {
            LimiterConfig::TokenBucket {
                rate, per, burst, ..
            }
            | LimiterConfig::FastTokenBucket {
                rate, per, burst, ..
            } => {
                if !positive(*rate) || !positive(*per) {
                    return fail("rate and per must be positive");
                }
                if burst.is_some_and(|b| !positive(b)) {
                    return fail("burst must be positive");
                }
            }
            LimiterConfig::SlidingWindow { rate, per, .. }
            | LimiterConfig::RedisSlidingWindow { rate, per, .. } => {
                if !positive(*rate) || !positive(*per) {
                    return fail("rate and per must be positive");
                }
            }
            LimiterConfig::LeakyBucket { rate, capacity, .. } => {
                if !positive(*rate) || !positive(*capacity) {
                    return fail("rate and capacity must be positive");
                }
            }
            LimiterConfig::Adaptive {
                initial_rate,
                min_rate,
                max_rate,
                increase_step,
                decrease_factor,
                error_threshold,
                window_secs,
            } => {
                if !positive(*min_rate) || !positive(*initial_rate) || !positive(*window_secs) {
                    return fail("rates and window_secs must be positive");
                }
                if min_rate > max_rate {
                    return fail("min_rate must not exceed max_rate");
                }
                if !increase_step.is_finite() || *increase_step < 0.0 {
                    return fail("increase_step must not be negative");
                }
                if !(*decrease_factor > 0.0 && *decrease_factor < 1.0) {
                    return fail("decrease_factor must be between 0 and 1");
                }
                if !(0.0..=1.0).contains(error_threshold) {
                    return fail("error_threshold must be between 0 and 1");
                }
            }
            LimiterConfig::Composite { members, .. } => {
                if members.is_empty() {
                    return fail("composite needs at least one member");
                }
                for (index, member) in members.iter().enumerate() {
                    member.validate(&format!("{}[{}]", name, index))?;
                }
            }
        }
        Ok(())
    }
}

/// One circuit breaker definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds the circuit stays open before a trial call
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_timeout_secs() -> f64 {
    60.0
}

impl BreakerConfig {
    /// Convert into the breaker's runtime configuration.
    pub fn to_breaker_config(&self) -> Result<CircuitBreakerConfig> {
        Ok(CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            timeout: seconds("timeout_secs", self.timeout_secs)?,
        })
    }
}

fn positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

fn seconds(field: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| FluxError::Config(format!("{} is not a valid duration: {}", field, e)))
}

impl FluxguardConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| FluxError::Config(format!("Failed to parse YAML config: {}", e)))
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| FluxError::Config(format!("Failed to parse JSON config: {}", e)))
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a file and layer `FLUXGUARD__*` environment variables on top,
    /// then validate the result.
    ///
    /// The format follows the file extension (YAML, JSON or TOML). Nested
    /// fields are separated by `__`, e.g. `FLUXGUARD__LOCK_SHARDS=128`.
    /// Keys are matched case-insensitively, so limiter names are lowercased.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading layered configuration");

        let config: FluxguardConfig = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Check every value for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.lock_shards == 0 {
            return Err(FluxError::Config("lock_shards must be positive".to_string()));
        }

        match &self.storage {
            StorageConfig::Memory { capacity } if *capacity == 0 => {
                return Err(FluxError::Config("memory capacity must be positive".to_string()));
            }
            StorageConfig::Hybrid { fast_capacity, .. } if *fast_capacity == 0 => {
                return Err(FluxError::Config("hybrid fast_capacity must be positive".to_string()));
            }
            _ => {}
        }

        for (name, limiter) in &self.limiters {
            limiter.validate(name)?;
            if limiter.needs_redis() && !self.storage.has_redis() {
                return Err(FluxError::Config(format!(
                    "limiter '{}': redis_sliding_window requires redis or hybrid storage",
                    name
                )));
            }
        }

        for (name, breaker) in &self.breakers {
            if breaker.failure_threshold == 0 {
                return Err(FluxError::Config(format!(
                    "breaker '{}': failure_threshold must be positive",
                    name
                )));
            }
            if !breaker.timeout_secs.is_finite() || breaker.timeout_secs < 0.0 {
                return Err(FluxError::Config(format!(
                    "breaker '{}': timeout_secs must not be negative",
                    name
                )));
            }
        }
        Ok(())
    }
}
