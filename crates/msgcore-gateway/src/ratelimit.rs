//! Per-session token bucket, spec §4.1 `read_pump` "rate-limit per session
//! (default 30 msg/s, burst 60)" / §5 Backpressure "per-session token-bucket
//! rate limit; excess frames closed with a policy error".

use std::sync::Mutex;

use tokio::time::Instant;

/// Classic token bucket: refills continuously at `rate` tokens/sec up to
/// `burst` capacity, starts full so a reconnecting client isn't immediately
/// throttled.
pub struct RateLimiter {
    rate_per_sec: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(rate_per_sec: u32, burst: u32) -> Self {
        Self {
            rate_per_sec: rate_per_sec.max(1) as f64,
            burst: burst.max(1) as f64,
            state: Mutex::new(BucketState {
                tokens: burst.max(1) as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Attempt to consume one token. Returns `false` if the bucket is empty
    /// — the caller should reject the frame with a policy error, not retry.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.burst);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_allows_up_to_capacity_then_rejects() {
        let limiter = RateLimiter::new(30, 3);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_refill_over_time() {
        let limiter = RateLimiter::new(10, 1);
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        tokio::time::advance(std::time::Duration::from_millis(150)).await;
        assert!(limiter.try_acquire());
    }
}
