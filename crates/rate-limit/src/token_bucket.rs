use std::time::Duration;

use tokio::time::Instant;

/// A continuously refilling token bucket for a single key.
///
/// The bucket holds at most `capacity` tokens and gains
/// `capacity / window` tokens per second, so a drained bucket is full again
/// after one `window`. Every permitted action consumes exactly one token.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket.
    ///
    /// * `capacity` - maximum burst size, also the number of tokens restored per `window`
    /// * `window`   - time it takes to refill an empty bucket
    pub fn new(capacity: u32, window: Duration, now: Instant) -> Self {
        let capacity = f64::from(capacity);
        Self {
            capacity,
            refill_per_sec: capacity / window.as_secs_f64(),
            tokens: capacity,
            last_refill: now,
        }
    }

    /// Refill for the time elapsed since the last call, then try to take one
    /// token. Returns `true` if a token was available and consumed.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available, as of the last refill.
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = self.last_refill.max(now);
    }
}
