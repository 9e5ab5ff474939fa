//! Token-bucket rate limiting keyed to the platform's `Ratelimit-Remaining`
//! / `Ratelimit-Reset` response headers (§5 "Rate limits").
//!
//! A plain refill-on-read token bucket guarded by a mutex, additionally
//! corrected from each response's rate-limit headers instead of only
//! self-refilling, since the upstream is authoritative about remaining
//! budget.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub max_tokens: f64,
    pub refill_rate: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_tokens: 30.0,
            refill_rate: 1.0,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(config: &RateLimiterConfig) -> Self {
        Self {
            tokens: config.max_tokens,
            max_tokens: config.max_tokens,
            refill_rate: config.refill_rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }
}

/// A single-platform token bucket, additionally steerable from response
/// headers so the client never has to guess the upstream's actual budget.
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            bucket: Mutex::new(Bucket::new(&config)),
        }
    }

    /// Blocks until a token is available, then consumes one.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                bucket.refill();
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                let needed = 1.0 - bucket.tokens;
                Duration::from_secs_f64(needed / bucket.refill_rate)
            };
            debug!(?wait, "twitch api rate limited, waiting for a token");
            tokio::time::sleep(wait).await;
        }
    }

    /// Corrects the bucket's token count from the upstream's own
    /// `Ratelimit-Remaining` header, and its refill schedule from
    /// `Ratelimit-Reset` (a unix timestamp in seconds).
    pub async fn observe_headers(&self, remaining: Option<u32>, reset_unix: Option<i64>) {
        let mut bucket = self.bucket.lock().await;
        if let Some(remaining) = remaining {
            bucket.tokens = remaining as f64;
        }
        if let Some(reset_unix) = reset_unix {
            let now_unix = chrono::Utc::now().timestamp();
            let window = (reset_unix - now_unix).max(1) as f64;
            // Pace refills so the bucket reaches max roughly by the reset
            // instant rather than instantaneously.
            bucket.refill_rate = (bucket.max_tokens / window).max(0.01);
        }
    }
}

/// Exponential backoff sequence used on HTTP 429, per §5: 2, 4, 8, ... seconds.
///
/// A plain bounded iterator value rather than a callback, so a caller can
/// pull the next delay repeatedly without re-deriving the formula.
pub struct Backoff429 {
    next_secs: u64,
    max_secs: u64,
}

impl Backoff429 {
    pub fn new() -> Self {
        Self {
            next_secs: 2,
            max_secs: 64,
        }
    }
}

impl Default for Backoff429 {
    fn default() -> Self {
        Self::new()
    }
}

impl Iterator for Backoff429 {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next_secs.min(self.max_secs);
        self.next_secs = (self.next_secs * 2).min(self.max_secs);
        Some(Duration::from_secs(current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff429::new();
        let got: Vec<u64> = (0..6).map(|_| backoff.next().unwrap().as_secs()).collect();
        assert_eq!(got, vec![2, 4, 8, 16, 32, 64]);
    }

    #[tokio::test]
    async fn observe_headers_sets_remaining_tokens() {
        let limiter = RateLimiter::new(RateLimiterConfig::default());
        limiter.observe_headers(Some(0), Some(chrono::Utc::now().timestamp() + 10)).await;
        let bucket = limiter.bucket.lock().await;
        assert_eq!(bucket.tokens, 0.0);
    }
}
