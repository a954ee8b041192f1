//! Token bucket shared by every REST call of a run.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// `qps` tokens per second up to `burst`. A non-positive `qps` disables limiting.
#[derive(Debug)]
pub struct RateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self { qps, burst, bucket: Mutex::new(Bucket { tokens: burst, last_refill: Instant::now() }) }
    }

    pub fn unlimited() -> Self { Self::new(0.0, 1) }

    /// Take a token without waiting.
    pub async fn try_acquire(&self) -> bool {
        if self.qps <= 0.0 {
            return true;
        }
        let mut b = self.bucket.lock().await;
        self.refill(&mut b);
        if b.tokens >= 1.0 {
            b.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait until a token is available. The lock is not held while sleeping.
    pub async fn acquire(&self) {
        if self.qps <= 0.0 {
            return;
        }
        loop {
            let wait = {
                let mut b = self.bucket.lock().await;
                self.refill(&mut b);
                if b.tokens >= 1.0 {
                    b.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - b.tokens) / self.qps)
            };
            tokio::time::sleep(wait).await;
        }
    }

    fn refill(&self, b: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(b.last_refill).as_secs_f64();
        b.last_refill = now;
        b.tokens = (b.tokens + elapsed * self.qps).min(self.burst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_then_refill() {
        let rl = RateLimiter::new(10.0, 3);
        for _ in 0..3 {
            assert!(rl.try_acquire().await);
        }
        assert!(!rl.try_acquire().await);
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(rl.try_acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_a_token() {
        let rl = RateLimiter::new(2.0, 1);
        rl.acquire().await;
        let started = Instant::now();
        rl.acquire().await;
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn zero_qps_is_unlimited() {
        let rl = RateLimiter::unlimited();
        for _ in 0..1000 {
            assert!(rl.try_acquire().await);
        }
    }
}
