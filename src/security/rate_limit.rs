//! Per-key token bucket rate limiting.
//!
//! # Responsibilities
//! - Refill each key's bucket by `elapsed * rate`, capped at `burst`
//! - Admit when at least one token is available, consuming it
//! - Bound memory by evicting idle buckets
//!
//! # Design Decisions
//! - One mutex per bucket; unrelated keys never contend
//! - The `DashMap` shard lock is never held while a bucket is locked on the
//!   hot path, so eviction and admission cannot deadlock
//! - Time is monotonic and clamped: an earlier `now` refills nothing
//! - A bucket is evicted only when idle for the TTL *and* full again, so
//!   eviction never grants more than a fresh bucket would

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Slack for float accumulation when comparing token counts.
const EPSILON: f64 = 1e-9;

/// Upper bound on a reported wait.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(86_400);

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// Admitted; `remaining` tokens are left in the bucket.
    Allowed { remaining: f64 },
    /// Denied; one token will be available after `retry_after`.
    Denied { retry_after: Duration },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

/// Token state for one key.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    /// Set by the sweeper when the bucket is removed from the map.
    evicted: bool,
}

impl TokenBucket {
    fn full(burst: f64, now: Instant) -> Self {
        Self {
            tokens: burst,
            last_refill: now,
            evicted: false,
        }
    }

    fn refill(&mut self, rate: f64, burst: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(burst);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    fn try_acquire(&mut self, rate: f64, burst: f64, now: Instant) -> Decision {
        self.refill(rate, burst, now);

        if self.tokens + EPSILON >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            Decision::Allowed {
                remaining: self.tokens,
            }
        } else {
            let missing = 1.0 - self.tokens;
            let retry_after = Duration::try_from_secs_f64(missing / rate)
                .unwrap_or(MAX_RETRY_AFTER)
                .min(MAX_RETRY_AFTER);
            Decision::Denied { retry_after }
        }
    }
}

/// A rate limiter holding one token bucket per client key.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    /// Tokens added per second.
    rate: f64,
    /// Bucket capacity.
    burst: f64,
    buckets: DashMap<String, Arc<Mutex<TokenBucket>>>,
}

impl TokenBucketLimiter {
    /// Create a limiter. Callers validate `rate > 0` and `burst >= 1`.
    pub fn new(rate: f64, burst: u32) -> Self {
        debug_assert!(rate > 0.0 && rate.is_finite());
        debug_assert!(burst >= 1);
        Self {
            rate,
            burst: f64::from(burst),
            buckets: DashMap::new(),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> u32 {
        self.burst as u32
    }

    /// Returns true if the request for `key` is admitted.
    pub fn allow(&self, key: &str) -> bool {
        self.check(key).is_allowed()
    }

    /// Check `key` against the limiter at the current instant.
    pub fn check(&self, key: &str) -> Decision {
        self.check_at(key, Instant::now())
    }

    /// Check `key` as if the current time were `now`.
    pub fn check_at(&self, key: &str, now: Instant) -> Decision {
        loop {
            let bucket = self.bucket(key, now);
            let mut guard = bucket.lock().unwrap_or_else(PoisonError::into_inner);
            if guard.evicted {
                // Lost a race with the sweeper; the next lookup creates a fresh bucket.
                // A bucket shared with a newer limiter may still be in this map.
                drop(guard);
                self.buckets.remove_if(key, |_, b| Arc::ptr_eq(b, &bucket));
                continue;
            }
            return guard.try_acquire(self.rate, self.burst, now);
        }
    }

    fn bucket(&self, key: &str, now: Instant) -> Arc<Mutex<TokenBucket>> {
        if let Some(existing) = self.buckets.get(key) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .buckets
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(TokenBucket::full(self.burst, now))));
        Arc::clone(entry.value())
    }

    /// Current token count for `key` without refilling, if tracked.
    pub fn tokens(&self, key: &str) -> Option<f64> {
        let bucket = self.buckets.get(key).map(|b| Arc::clone(b.value()))?;
        let guard = bucket.lock().unwrap_or_else(PoisonError::into_inner);
        Some(guard.tokens)
    }

    /// Number of keys currently holding a bucket.
    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }

    /// Evict buckets idle for at least `ttl` whose tokens have fully refilled.
    /// Returns the number of evicted buckets.
    pub fn evict_idle(&self, now: Instant, ttl: Duration) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            let mut guard = bucket.lock().unwrap_or_else(PoisonError::into_inner);
            let idle = now.saturating_duration_since(guard.last_refill);
            if idle < ttl {
                return true;
            }
            guard.refill(self.rate, self.burst, now);
            if guard.tokens + EPSILON < self.burst {
                return true;
            }
            guard.evicted = true;
            false
        });
        before.saturating_sub(self.buckets.len())
    }

    /// Build a limiter with new parameters over the same buckets, clamping
    /// token counts to the new burst.
    ///
    /// Buckets are shared, not copied: tokens taken through this limiter
    /// while requests still hold the old snapshot are seen by the new one.
    /// Only a key first seen by the old limiter after this call starts over
    /// with a fresh bucket in the new one.
    pub fn reconfigured(&self, rate: f64, burst: u32) -> Self {
        let next = Self::new(rate, burst);
        for entry in self.buckets.iter() {
            let bucket = Arc::clone(entry.value());
            {
                let mut guard = bucket.lock().unwrap_or_else(PoisonError::into_inner);
                if guard.evicted {
                    continue;
                }
                guard.tokens = guard.tokens.min(next.burst);
            }
            next.buckets.insert(entry.key().clone(), bucket);
        }
        next
    }
}
