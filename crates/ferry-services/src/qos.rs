//! Speed cap: a token bucket over payload bytes.
//!
//! One token is one byte. The bucket holds at most one second of traffic,
//! so a sender that has been idle may burst up to `rate` bytes before it is
//! throttled. A rate of 0 disables the cap.

use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct SpeedLimit {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl SpeedLimit {
    pub fn new(bytes_per_sec: u64) -> Self {
        let rate = if bytes_per_sec == 0 {
            f64::INFINITY
        } else {
            bytes_per_sec as f64
        };
        Self {
            tokens: rate,
            capacity: rate,
            refill_rate: rate,
            last_refill: Instant::now(),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn is_unlimited(&self) -> bool {
        self.refill_rate.is_infinite()
    }

    /// Take `n` bytes from the bucket and return how long the caller must
    /// wait before writing them. The balance may go negative; the debt is
    /// paid off by later refills.
    pub fn reserve(&mut self, n: u64) -> Duration {
        if self.is_unlimited() {
            return Duration::ZERO;
        }

        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;

        self.tokens -= n as f64;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.refill_rate)
        }
    }

    /// Wait until `n` more bytes may be written.
    pub async fn acquire(&mut self, n: u64) {
        let wait = self.reserve(n);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}
