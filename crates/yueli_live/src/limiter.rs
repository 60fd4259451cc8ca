//! Token bucket used per downstream consumer.

use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct TokenBucket {
    rate_per_sec: f64,
    burst: f64,
    tokens: f64,
    refilled_at: Instant,
}

impl TokenBucket {
    /// Starts full. A non-positive rate disables limiting.
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            rate_per_sec,
            burst,
            tokens: burst,
            refilled_at: Instant::now(),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        !(self.rate_per_sec > 0.0)
    }

    pub fn try_take(&mut self) -> bool {
        if self.is_unlimited() {
            return true;
        }
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.refilled_at).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.burst);
        self.refilled_at = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
