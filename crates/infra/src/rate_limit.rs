//! Per-user request limiting for payment entry points.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use apexfin_core::{DomainError, DomainResult, UserId};

/// Injectable request limiter keyed by user.
///
/// The local token-bucket implementation below serves single-instance
/// deployments; multi-instance deployments implement this trait against a
/// shared store.
pub trait RateLimiter: Send + Sync {
    /// Consume one token for `user`, failing `RateLimited` when the bucket
    /// is empty.
    fn check(&self, user: UserId) -> DomainResult<()>;
}

/// Limiter that never rejects. Useful for tests and internal callers.
#[derive(Debug, Default)]
pub struct NoopLimiter;

impl RateLimiter for NoopLimiter {
    fn check(&self, _user: UserId) -> DomainResult<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: u32,
    last_refill: Instant,
}

/// Local token-bucket limiter.
///
/// Each user gets `capacity` tokens; one token refills every
/// `refill_interval`. Integer arithmetic only, no background task: refill is
/// computed lazily on each check.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    capacity: u32,
    refill_interval: Duration,
    buckets: Mutex<HashMap<UserId, Bucket>>,
}

impl TokenBucketLimiter {
    pub fn new(capacity: u32, refill_interval: Duration) -> Self {
        Self {
            capacity,
            refill_interval,
            buckets: Mutex::new(HashMap::new()),
        }
    }
}

impl RateLimiter for TokenBucketLimiter {
    fn check(&self, user: UserId) -> DomainResult<()> {
        let mut buckets = self
            .buckets
            .lock()
            .map_err(|_| DomainError::conflict("rate limiter lock poisoned"))?;

        let now = Instant::now();
        let bucket = buckets.entry(user).or_insert(Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        if !self.refill_interval.is_zero() {
            let elapsed = now.duration_since(bucket.last_refill);
            let refilled = (elapsed.as_millis() / self.refill_interval.as_millis()) as u32;
            if refilled > 0 {
                bucket.tokens = bucket.tokens.saturating_add(refilled).min(self.capacity);
                bucket.last_refill = now;
            }
        }

        if bucket.tokens == 0 {
            return Err(DomainError::RateLimited);
        }
        bucket.tokens -= 1;
        Ok(())
    }
}
