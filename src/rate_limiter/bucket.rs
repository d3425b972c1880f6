//! A single token bucket: `(rate, burst, tokens, last_refill)`.

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

struct Inner {
    tokens: f64,
    last_refill: Instant,
}

/// `0 ≤ tokens ≤ burst`; tokens increase by `rate · Δt` on each acquire
/// attempt, capped at `burst`. `acquire` blocks until a token is available.
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    inner: Mutex<Inner>,
}

impl TokenBucket {
    /// Build a bucket starting full (`tokens = burst`), matching the
    /// teacher's `SpeedLimiter::new` behavior of a ready-to-use bucket.
    pub fn new(rate: f64, burst: u32) -> Self {
        let burst = burst.max(1) as f64;
        Self {
            rate,
            burst,
            inner: Mutex::new(Inner {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Consume one token, refilling first and sleeping out-of-lock when the
    /// bucket is empty, then retrying. Never returns early without a token;
    /// cancellation is the caller's responsibility via `tokio::select!`.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut inner = self.inner.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(inner.last_refill).as_secs_f64();
                inner.tokens = (inner.tokens + elapsed * self.rate).min(self.burst);
                inner.last_refill = now;

                if inner.tokens >= 1.0 {
                    inner.tokens -= 1.0;
                    None
                } else {
                    let deficit = 1.0 - inner.tokens;
                    Some(Duration::from_secs_f64(deficit / self.rate))
                }
            };

            match wait {
                None => return,
                Some(duration) => tokio::time::sleep(duration).await,
            }
        }
    }

    /// Tokens currently available, for tests and diagnostics.
    #[cfg(test)]
    pub async fn available(&self) -> f64 {
        self.inner.lock().await.tokens
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant as StdInstant;

    #[tokio::test]
    async fn starts_full_and_drains_on_acquire() {
        let bucket = TokenBucket::new(2.0, 2);
        assert!(bucket.available().await >= 1.9);
        bucket.acquire().await;
        assert!(bucket.available().await < 1.1);
    }

    #[tokio::test]
    async fn monotonicity_bounds_acquisitions_in_a_window() {
        // rate=10/s, burst=1: in any 1-second window, at most burst + rate*T
        // acquisitions should complete. Run 12 acquisitions and check total
        // elapsed time is consistent with the rate, not instantaneous.
        let bucket = Arc::new(TokenBucket::new(10.0, 1));
        let start = StdInstant::now();
        for _ in 0..12 {
            bucket.acquire().await;
        }
        let elapsed = start.elapsed();
        // 12 acquisitions at burst=1, rate=10/s: first is free, remaining 11
        // require at least 1/rate seconds apart, i.e. >= ~1.0s total.
        assert!(
            elapsed >= Duration::from_millis(900),
            "expected rate limiting to slow acquisitions, elapsed={elapsed:?}"
        );
    }

    #[tokio::test]
    async fn concurrent_callers_are_all_eventually_served() {
        let bucket = Arc::new(TokenBucket::new(50.0, 5));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let bucket = bucket.clone();
            handles.push(tokio::spawn(async move {
                bucket.acquire().await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
