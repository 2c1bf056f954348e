use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Quota buckets are shared infrastructure: one window for all generation
/// calls in a run, one for outbound email, regardless of which worker makes
/// the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaBucket {
    Generation,
    Email,
}

#[derive(Debug, Clone, Copy)]
struct BucketLimit {
    max_calls: u32,
    window: Duration,
}

/// Process-scoped sliding-window rate limiter. Constructed per service
/// instance (no globals) so tests get isolated state.
pub struct RateLimiter {
    limits: HashMap<QuotaBucket, BucketLimit>,
    windows: Mutex<HashMap<QuotaBucket, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(generation_per_minute: u32, email_per_minute: u32) -> Self {
        let mut limits = HashMap::new();
        limits.insert(
            QuotaBucket::Generation,
            BucketLimit {
                max_calls: generation_per_minute.max(1),
                window: Duration::from_secs(60),
            },
        );
        limits.insert(
            QuotaBucket::Email,
            BucketLimit {
                max_calls: email_per_minute.max(1),
                window: Duration::from_secs(60),
            },
        );
        Self {
            limits,
            windows: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn with_limit(bucket: QuotaBucket, max_calls: u32, window: Duration) -> Self {
        let mut limits = HashMap::new();
        limits.insert(bucket, BucketLimit { max_calls, window });
        Self {
            limits,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Wait until the bucket's window admits one more call, then record it.
    pub async fn acquire(&self, bucket: QuotaBucket) {
        let limit = match self.limits.get(&bucket) {
            Some(limit) => *limit,
            None => return,
        };

        loop {
            let wait = {
                let mut windows = self.windows.lock().await;
                let stamps = windows.entry(bucket).or_default();
                let now = Instant::now();
                while let Some(front) = stamps.front() {
                    if now.duration_since(*front) >= limit.window {
                        stamps.pop_front();
                    } else {
                        break;
                    }
                }
                if (stamps.len() as u32) < limit.max_calls {
                    stamps.push_back(now);
                    return;
                }
                // Oldest stamp frees the next slot.
                limit.window - now.duration_since(*stamps.front().unwrap_or(&now))
            };

            tracing::debug!("Quota bucket {:?} saturated, waiting {:?}", bucket, wait);
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_calls_under_the_limit_immediately() {
        let limiter = RateLimiter::with_limit(QuotaBucket::Generation, 3, Duration::from_secs(60));
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire(QuotaBucket::Generation).await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn blocks_until_the_window_slides() {
        let limiter = RateLimiter::with_limit(QuotaBucket::Email, 2, Duration::from_millis(150));
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire(QuotaBucket::Email).await;
        }
        // The third call had to wait for the first stamp to expire.
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn unknown_bucket_is_a_no_op() {
        let limiter = RateLimiter::with_limit(QuotaBucket::Email, 1, Duration::from_secs(60));
        let start = Instant::now();
        limiter.acquire(QuotaBucket::Generation).await;
        limiter.acquire(QuotaBucket::Generation).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
