//! Token bucket rate limiter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A token bucket that refills continuously and caps at its capacity.
///
/// Time is passed in explicitly so the enforcer can drive it from its
/// clock. Moving backwards in time refills nothing.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill_at: DateTime<Utc>,
}

/// Serializable view of a [`TokenBucket`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterState {
    /// Maximum tokens.
    pub capacity: f64,
    /// Tokens added per second.
    pub refill_rate: f64,
    /// Tokens currently available.
    pub tokens: f64,
    /// When tokens were last added.
    pub last_refill_at: DateTime<Utc>,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(capacity: f64, refill_per_sec: f64, now: DateTime<Utc>) -> Self {
        Self {
            capacity,
            refill_per_sec,
            tokens: capacity,
            last_refill_at: now,
        }
    }

    /// An empty bucket.
    pub fn empty(capacity: f64, refill_per_sec: f64, now: DateTime<Utc>) -> Self {
        Self {
            tokens: 0.0,
            ..Self::new(capacity, refill_per_sec, now)
        }
    }

    /// Add the tokens accrued since the last refill.
    pub fn refill(&mut self, now: DateTime<Utc>) {
        let Some(micros) = (now - self.last_refill_at).num_microseconds() else {
            self.tokens = self.capacity;
            self.last_refill_at = now;
            return;
        };
        if micros <= 0 {
            return;
        }
        let elapsed = micros as f64 / 1_000_000.0;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill_at = now;
    }

    /// Take one token if available.
    pub fn try_acquire(&mut self, now: DateTime<Utc>) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens available at `now`.
    pub fn available(&mut self, now: DateTime<Utc>) -> f64 {
        self.refill(now);
        self.tokens
    }

    /// Snapshot the bucket without refilling.
    pub fn state(&self) -> RateLimiterState {
        RateLimiterState {
            capacity: self.capacity,
            refill_rate: self.refill_per_sec,
            tokens: self.tokens,
            last_refill_at: self.last_refill_at,
        }
    }
}
