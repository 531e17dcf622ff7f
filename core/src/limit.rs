//! Token-bucket byte rate limiting.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// A concurrency-safe token bucket measured in bytes.
///
/// Tokens refill continuously at `rate` bytes per second up to `burst`.
/// [`consume`](TokenBucket::consume) waits until enough tokens are
/// available; charges larger than the burst are taken in burst-sized
/// slices.
#[derive(Debug)]
pub struct TokenBucket {
    rate: u64,
    burst: u64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    refilled: Instant,
}

impl TokenBucket {
    /// Creates a bucket with `rate` bytes/s and `burst` bytes, starting
    /// full.
    pub fn new(rate: u64, burst: u64) -> Self {
        let burst = burst.max(1);
        Self {
            rate: rate.max(1),
            burst,
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                refilled: Instant::now(),
            }),
        }
    }

    /// Waits until `n` bytes worth of tokens are available and takes them.
    pub async fn consume(&self, n: u64) {
        let mut remaining = n;
        while remaining > 0 {
            let take = remaining.min(self.burst);
            loop {
                let wait = self.try_take(take);
                match wait {
                    None => break,
                    Some(d) => tokio::time::sleep(d).await,
                }
            }
            remaining -= take;
        }
    }

    /// Takes `n` tokens if available, else returns how long to wait.
    fn try_take(&self, n: u64) -> Option<Duration> {
        let mut st = self.state.lock().unwrap();

        let now = Instant::now();
        let elapsed = now.duration_since(st.refilled).as_secs_f64();
        st.tokens = (st.tokens + elapsed * self.rate as f64).min(self.burst as f64);
        st.refilled = now;

        let need = n as f64;
        if st.tokens >= need {
            st.tokens -= need;
            None
        } else {
            Some(Duration::from_secs_f64((need - st.tokens) / self.rate as f64))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_free() {
        let bucket = TokenBucket::new(1000, 100);

        let start = Instant::now();
        bucket.consume(100).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_waits_for_refill() {
        let bucket = TokenBucket::new(1000, 100);

        bucket.consume(100).await;
        let start = Instant::now();
        bucket.consume(50).await;
        // 50 tokens at 1000 tokens/s
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(start.elapsed() < Duration::from_millis(80));
    }

    #[tokio::test(start_paused = true)]
    async fn test_large_charge_paces_at_rate() {
        let bucket = TokenBucket::new(1000, 100);

        let start = Instant::now();
        // 1100 bytes: 100 burst free, 1000 more at 1000 B/s
        bucket.consume(1100).await;
        assert!(start.elapsed() >= Duration::from_millis(1000));
        assert!(start.elapsed() < Duration::from_millis(1200));
    }
}
