//! Token-bucket rate limiting
//!
//! One bucket per client key, created lazily with a full load of tokens and
//! refilled continuously from wall-clock elapsed time. This is a soft
//! throttle for the request path, not an authorization boundary.

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Fallback retry hint when a bucket never refills
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// A single continuously-refilling token bucket
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Full bucket holding `capacity` tokens, refilling at `refill_rate`
    /// tokens per second
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self::new_at(capacity, refill_rate, Instant::now())
    }

    pub fn new_at(capacity: u32, refill_rate: f64, now: Instant) -> Self {
        Self {
            capacity: capacity as f64,
            tokens: capacity as f64,
            refill_rate: refill_rate.max(0.0),
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token if any is available
    pub fn consume(&mut self) -> bool {
        self.consume_at(Instant::now())
    }

    pub fn consume_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens > 0.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Whole tokens currently available
    pub fn remaining(&mut self) -> u32 {
        self.remaining_at(Instant::now())
    }

    pub fn remaining_at(&mut self, now: Instant) -> u32 {
        self.refill(now);
        self.tokens.max(0.0).floor() as u32
    }

    /// Time until a request would be allowed again, in whole seconds
    ///
    /// A request passes once the balance is above zero, so the wait covers
    /// the current debt and nothing more.
    pub fn retry_after(&self) -> Duration {
        if self.refill_rate <= 0.0 {
            return DEFAULT_RETRY_AFTER;
        }
        let deficit = (-self.tokens).max(0.0) + f64::EPSILON;
        let secs = (deficit / self.refill_rate).ceil().max(1.0);
        Duration::from_secs_f64(secs)
    }

    fn idle_since(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_refill)
    }
}

/// Outcome of a rate-limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed { remaining: u32 },
    Denied { retry_after: Duration },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed { .. })
    }
}

/// Per-key token buckets
///
/// Each bucket lives in its own map shard entry, so refill-and-consume for a
/// key is serialized while different keys proceed in parallel.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<String, TokenBucket>,
    capacity: u32,
    refill_rate: f64,
}

impl RateLimiter {
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            buckets: DashMap::new(),
            capacity,
            refill_rate,
        }
    }

    /// Consume one token for `key`
    pub fn check(&self, key: &str) -> RateLimitDecision {
        self.check_at(key, Instant::now())
    }

    pub fn check_at(&self, key: &str, now: Instant) -> RateLimitDecision {
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new_at(self.capacity, self.refill_rate, now));

        if bucket.consume_at(now) {
            RateLimitDecision::Allowed {
                remaining: bucket.remaining_at(now),
            }
        } else {
            RateLimitDecision::Denied {
                retry_after: bucket.retry_after(),
            }
        }
    }

    /// Remaining tokens for `key` without consuming; a fresh key reports full
    /// capacity
    pub fn remaining(&self, key: &str) -> u32 {
        match self.buckets.get_mut(key) {
            Some(mut bucket) => bucket.remaining_at(Instant::now()),
            None => self.capacity,
        }
    }

    /// Drop buckets untouched for at least `idle`
    ///
    /// A bucket idle that long has refilled completely when `idle` is at
    /// least `capacity / refill_rate`, so dropping it loses no state.
    pub fn prune_idle(&self, idle: Duration) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.idle_since(now) < idle);
        before - self.buckets.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }
}
