//! Per-key limiter statistics.

use serde::Serialize;

/// State of one limiter key, as reported by [`Limiter::get_stats`](super::Limiter::get_stats).
///
/// Every variant carries a capacity indicator and a rate indicator, exposed
/// uniformly through [`available`](Self::available) and [`rate`](Self::rate).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum LimiterStats {
    /// Token bucket (storage-backed or in-process)
    TokenBucket {
        available_tokens: f64,
        max_tokens: f64,
        /// Tokens added per second
        refill_rate: f64,
        last_update: f64,
    },
    /// Sliding window log
    SlidingWindow {
        current_count: usize,
        max_count: f64,
        window_seconds: f64,
        available: f64,
    },
    /// Leaky bucket
    LeakyBucket {
        current_level: f64,
        capacity: f64,
        /// Units drained per second
        leak_rate: f64,
        last_update: f64,
    },
    /// Adaptive (AIMD) limiter
    Adaptive {
        current_rate: f64,
        min_rate: f64,
        max_rate: f64,
        available_tokens: f64,
        success_count: u64,
        error_count: u64,
    },
    /// Composite limiter, one entry per member in evaluation order
    Composite { limiters: Vec<LimiterStats> },
}

impl LimiterStats {
    /// Amount that could be admitted right now.
    ///
    /// For a composite this is the tightest member.
    pub fn available(&self) -> f64 {
        match self {
            LimiterStats::TokenBucket {
                available_tokens, ..
            } => *available_tokens,
            LimiterStats::SlidingWindow { available, .. } => *available,
            LimiterStats::LeakyBucket {
                current_level,
                capacity,
                ..
            } => (capacity - current_level).max(0.0),
            LimiterStats::Adaptive {
                available_tokens, ..
            } => *available_tokens,
            LimiterStats::Composite { limiters } => limiters
                .iter()
                .map(LimiterStats::available)
                .fold(f64::INFINITY, f64::min),
        }
    }

    /// Sustained admission rate in units per second.
    pub fn rate(&self) -> f64 {
        match self {
            LimiterStats::TokenBucket { refill_rate, .. } => *refill_rate,
            LimiterStats::SlidingWindow {
                max_count,
                window_seconds,
                ..
            } => max_count / window_seconds,
            LimiterStats::LeakyBucket { leak_rate, .. } => *leak_rate,
            LimiterStats::Adaptive { current_rate, .. } => *current_rate,
            LimiterStats::Composite { limiters } => limiters
                .iter()
                .map(LimiterStats::rate)
                .fold(f64::INFINITY, f64::min),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_indicators() {
        let bucket = LimiterStats::TokenBucket {
            available_tokens: 3.0,
            max_tokens: 5.0,
            refill_rate: 5.0,
            last_update: 0.0,
        };
        let window = LimiterStats::SlidingWindow {
            current_count: 8,
            max_count: 10.0,
            window_seconds: 2.0,
            available: 2.0,
        };
        let leaky = LimiterStats::LeakyBucket {
            current_level: 7.5,
            capacity: 10.0,
            leak_rate: 1.0,
            last_update: 0.0,
        };

        assert_eq!(bucket.available(), 3.0);
        assert_eq!(window.rate(), 5.0);
        assert_eq!(leaky.available(), 2.5);

        let composite = LimiterStats::Composite {
            limiters: vec![bucket, window, leaky],
        };
        assert_eq!(composite.available(), 2.0);
        assert_eq!(composite.rate(), 1.0);
    }

    #[test]
    fn test_serializes_with_algorithm_tag() {
        let stats = LimiterStats::LeakyBucket {
            current_level: 1.0,
            capacity: 2.0,
            leak_rate: 0.5,
            last_update: 10.0,
        };

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["algorithm"], "leaky_bucket");
        assert_eq!(json["capacity"], 2.0);
    }
}
