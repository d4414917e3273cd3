//! Composite limiter: admits only when every member admits.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use super::backend::Limiter;
use super::stats::LimiterStats;
use crate::error::Result;

/// Applies several limiters to one admission decision.
///
/// Members are asked in order and evaluation stops at the first rejection.
/// By default tokens already taken by earlier members stay taken when a
/// later member refuses or fails; callers wanting all-or-nothing either
/// release them or enable [`with_rollback`](Self::with_rollback).
#[derive(Debug)]
pub struct CompositeLimiter {
    limiters: Vec<Arc<dyn Limiter>>,
    rollback_on_reject: bool,
}

impl CompositeLimiter {
    pub fn new(limiters: Vec<Arc<dyn Limiter>>) -> Self {
        Self {
            limiters,
            rollback_on_reject: false,
        }
    }

    /// Release tokens on members that admitted when a later member rejects
    /// or returns an error.
    pub fn with_rollback(mut self, enabled: bool) -> Self {
        self.rollback_on_reject = enabled;
        self
    }

    pub fn limiters(&self) -> &[Arc<dyn Limiter>] {
        &self.limiters
    }

    async fn roll_back(&self, admitted: &[Arc<dyn Limiter>], key: &str, tokens: f64) {
        for limiter in admitted.iter().rev() {
            if let Err(e) = limiter.release(key, tokens).await {
                warn!(key = %key, error = %e, "Failed to roll back composite member");
            }
        }
    }
}

#[async_trait]
impl Limiter for CompositeLimiter {
    async fn acquire(&self, key: &str, tokens: f64) -> Result<bool> {
        for (index, limiter) in self.limiters.iter().enumerate() {
            let admitted = match limiter.acquire(key, tokens).await {
                Ok(admitted) => admitted,
                Err(e) => {
                    if self.rollback_on_reject {
                        self.roll_back(&self.limiters[..index], key, tokens).await;
                    }
                    return Err(e);
                }
            };
            if !admitted {
                debug!(key = %key, member = index, "Composite limiter rejected request");
                if self.rollback_on_reject {
                    self.roll_back(&self.limiters[..index], key, tokens).await;
                }
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn release(&self, key: &str, tokens: f64) -> Result<()> {
        for limiter in &self.limiters {
            limiter.release(key, tokens).await?;
        }
        Ok(())
    }

    async fn get_stats(&self, key: &str) -> Result<LimiterStats> {
        let mut limiters = Vec::with_capacity(self.limiters.len());
        for limiter in &self.limiters {
            limiters.push(limiter.get_stats(key).await?);
        }
        Ok(LimiterStats::Composite { limiters })
    }
}
