//! Per-client admission control for the mempool console.
//!
//! [`RateLimiter`] tracks a [`TokenBucket`] for every key it has seen
//! recently (client IP addresses in practice) and answers whether that key
//! may act right now. Memory is bounded: at most `capacity` keys are tracked,
//! and once the table is full new keys are refused until the periodic sweep
//! started by [`RateLimiter::run`] evicts idle ones.

pub mod token_bucket;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use mempool_common::{MempoolResult, RateLimiterConfig};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use token_bucket::TokenBucket;

/// Rate state for one key plus the time it was last checked.
#[derive(Debug)]
struct TrackedKey {
    bucket: TokenBucket,
    last_seen_at: Instant,
}

struct Inner {
    entries: Mutex<HashMap<String, TrackedKey>>,
    cleanup_duration: Duration,
    capacity: usize,
    allowed_occurrences: u32,
}

/// A bounded, keyed token-bucket rate limiter.
///
/// The limiter is cheaply cloneable (backed by `Arc`) and safe to share
/// across tasks and threads. All access to the key table goes through a
/// single mutex, so a check-and-update on one key is atomic with respect to
/// every other check and to the sweep.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

impl RateLimiter {
    /// Create a limiter allowing `allowed_occurrences` actions per
    /// `cleanup_duration` for each of at most `capacity` keys.
    ///
    /// All three settings must be positive.
    pub fn new(config: &RateLimiterConfig) -> MempoolResult<Self> {
        config.validate()?;

        info!(
            cleanup_duration_secs = config.cleanup_duration_secs,
            capacity = config.capacity,
            allowed_occurrences = config.allowed_occurrences,
            "creating rate limiter"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                cleanup_duration: config.cleanup_duration(),
                capacity: config.capacity,
                allowed_occurrences: config.allowed_occurrences,
            }),
        })
    }

    /// Check whether `key` is allowed to act right now.
    ///
    /// The first check for an unknown key creates a full bucket and is
    /// allowed without consuming a token, so a fresh key gets one extra
    /// action on top of `allowed_occurrences`. When `capacity` keys are
    /// already tracked an unknown key is refused; tracked keys are never
    /// evicted to make room.
    pub fn is_allowed(&self, key: &str) -> bool {
        let mut entries = self.lock();
        let now = Instant::now();

        match entries.get_mut(key) {
            Some(tracked) => {
                tracked.last_seen_at = now;
                tracked.bucket.try_acquire(now)
            }
            None => {
                if entries.len() >= self.inner.capacity {
                    return false;
                }

                let bucket = TokenBucket::new(
                    self.inner.allowed_occurrences,
                    self.inner.cleanup_duration,
                    now,
                );
                entries.insert(
                    key.to_string(),
                    TrackedKey {
                        bucket,
                        last_seen_at: now,
                    },
                );
                true
            }
        }
    }

    /// Remove every key that has not been checked for longer than the
    /// cleanup duration. Returns the number of keys removed.
    pub fn sweep(&self) -> usize {
        let mut entries = self.lock();
        let now = Instant::now();
        let idle_limit = self.inner.cleanup_duration;

        let before = entries.len();
        entries.retain(|_key, tracked| {
            now.saturating_duration_since(tracked.last_seen_at) <= idle_limit
        });
        let evicted = before - entries.len();

        debug!(
            evicted,
            remaining = entries.len(),
            "rate limiter sweep complete"
        );
        evicted
    }

    /// Sweep idle keys once per cleanup duration until `token` is cancelled.
    ///
    /// The ticker is owned by this future and released when it returns.
    pub async fn run(&self, token: CancellationToken) {
        let period = self.inner.cleanup_duration;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep();
                }
            }
        }

        debug!("rate limiter sweep loop stopped");
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TrackedKey>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
