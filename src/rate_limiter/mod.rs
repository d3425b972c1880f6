//! Scope-routed token-bucket rate limiter.
//!
//! The remote platform enforces four independent throttling scopes with
//! widely different ceilings. One [`TokenBucket`] per scope; routing from a
//! request path to a scope is [`crate::config::RateScope::classify`].
//! Unlike the teacher's per-IP HTTP middleware bucket (which returns a
//! retry-after hint to the caller), `Wait` here blocks the caller — the
//! remote client has nowhere else to hand the request off to.

mod bucket;
mod metrics;

pub use bucket::TokenBucket;
pub use metrics::ApiMetrics;

use crate::config::{RateLimitConfig, RateScope, ServiceConfig};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Outcome of a [`RateLimiter::wait`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A token was acquired; the caller may proceed
    Ok,
    /// The caller's cancellation token fired before a token became available
    Cancelled,
}

/// One bucket per [`RateScope`], shared by reference across every daemon in
/// the process. Each bucket is its own synchronization domain.
pub struct RateLimiter {
    buckets: HashMap<RateScope, TokenBucket>,
    metrics: ApiMetrics,
}

impl RateLimiter {
    /// Build a limiter with one bucket per scope, sized from `config`.
    pub fn new(config: &ServiceConfig) -> Arc<Self> {
        let buckets = RateScope::ALL
            .iter()
            .map(|&scope| {
                let RateLimitConfig { rate, burst } = config.rate_limit_for(scope);
                (scope, TokenBucket::new(rate, burst))
            })
            .collect();

        Arc::new(Self {
            buckets,
            metrics: ApiMetrics::new(),
        })
    }

    /// Wait for a token in the bucket that `path` routes to, or return
    /// `Cancelled` if `cancel` fires first. Increments the path's call
    /// counter on every attempt, win or lose.
    pub async fn wait(&self, path: &str, cancel: &CancellationToken) -> WaitOutcome {
        let scope = RateScope::classify(path);
        self.metrics.record_call(path);

        let bucket = self
            .buckets
            .get(&scope)
            .expect("bucket map is seeded for every RateScope variant");

        tokio::select! {
            _ = bucket.acquire() => WaitOutcome::Ok,
            _ = cancel.cancelled() => WaitOutcome::Cancelled,
        }
    }

    /// Note a 429 response inferred to belong to `scope`, carrying the
    /// server's retry hint if any. Does not alter local tokens — the retry
    /// loop in `retry.rs` governs the actual wait.
    pub fn record_rate_limited(&self, scope: RateScope, retry_after: Option<std::time::Duration>) {
        tracing::warn!(
            ?scope,
            retry_after_secs = retry_after.map(|d| d.as_secs()),
            "remote returned 429"
        );
    }

    /// Snapshot of call-volume metrics, for diagnostics.
    pub fn metrics(&self) -> &ApiMetrics {
        &self.metrics
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_on_default_scope_succeeds_without_cancellation() {
        let config = ServiceConfig::default();
        let limiter = RateLimiter::new(&config);
        let cancel = CancellationToken::new();
        let outcome = limiter.wait("/api/v3/users/me/", &cancel).await;
        assert_eq!(outcome, WaitOutcome::Ok);
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_blocked_wait() {
        let mut config = ServiceConfig::default();
        config.rate_limits.insert(
            RateScope::JobSubmit,
            RateLimitConfig {
                rate: 0.01,
                burst: 1,
            },
        );
        let limiter = RateLimiter::new(&config);
        let cancel = CancellationToken::new();

        // Drain the single burst token first.
        let first = limiter.wait("/api/v2/jobs/1/submit/", &cancel).await;
        assert_eq!(first, WaitOutcome::Ok);

        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            cancel_clone.cancel();
        });

        let second = limiter.wait("/api/v2/jobs/1/submit/", &cancel).await;
        assert_eq!(second, WaitOutcome::Cancelled);
    }
}
