//! Keyed limiter registry.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

use super::bucket::{RetryAfter, TokenBucket};
use super::rules::RateRule;
use crate::error::{Result, TurnstileError};

/// Owns one token bucket per limiter key.
///
/// Buckets are created on the first admission check for a key, sized from the
/// rule passed to that check, and kept for the lifetime of the registry. This
/// struct is thread-safe and can be shared across multiple tasks.
pub struct KeyedLimiterRegistry {
    /// Buckets indexed by limiter key
    limiters: DashMap<String, Arc<TokenBucket>>,
    /// Log a warning each time the key count reaches a multiple of this
    key_warning_threshold: Option<usize>,
}

impl KeyedLimiterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            limiters: DashMap::new(),
            key_warning_threshold: None,
        }
    }

    /// Create an empty registry that warns as the key space grows.
    ///
    /// Keys are never evicted, so a registry fed unbounded client addresses
    /// grows without bound; the warning makes that visible.
    pub fn with_key_warning_threshold(threshold: usize) -> Self {
        Self {
            limiters: DashMap::new(),
            key_warning_threshold: (threshold > 0).then_some(threshold),
        }
    }

    /// Check a single request against the bucket for `key`.
    pub fn allow(&self, key: &str, rule: &RateRule) -> bool {
        self.allow_n(key, rule, 1)
    }

    /// Check a request costing `n` tokens against the bucket for `key`.
    pub fn allow_n(&self, key: &str, rule: &RateRule, n: u32) -> bool {
        self.allow_n_at(key, rule, n, Instant::now())
    }

    /// Check a request costing `n` tokens at `now`.
    ///
    /// The bucket is created from `rule` if `key` has none yet. The map lock
    /// is released before tokens are taken, so only requests sharing a key
    /// contend on the decrement.
    pub fn allow_n_at(&self, key: &str, rule: &RateRule, n: u32, now: Instant) -> bool {
        let limiter = self.get_or_create(key, rule, now);
        let allowed = limiter.allow_n_at(n, now);

        trace!(key = %key, cost = n, allowed = allowed, "Checked rate limit");

        if !allowed {
            debug!(key = %key, cost = n, "Rate limit exceeded");
        }
        allowed
    }

    /// How long until a single request on `key` would be admitted.
    pub fn retry_after(&self, key: &str) -> Result<RetryAfter> {
        self.retry_after_at(key, Instant::now())
    }

    /// How long, as seen from `now`, until a single request on `key` would be
    /// admitted. Nothing is consumed.
    ///
    /// Fails with [`TurnstileError::KeyNotFound`] if no admission check has
    /// been made for `key`.
    pub fn retry_after_at(&self, key: &str, now: Instant) -> Result<RetryAfter> {
        let limiter = self
            .limiter(key)
            .ok_or_else(|| TurnstileError::KeyNotFound(key.to_string()))?;
        Ok(limiter.reserve_n_at(1, now))
    }

    /// The bucket registered for `key`, if any.
    pub fn limiter(&self, key: &str) -> Option<Arc<TokenBucket>> {
        self.limiters.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Get the number of registered keys.
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    fn get_or_create(&self, key: &str, rule: &RateRule, now: Instant) -> Arc<TokenBucket> {
        if let Some(limiter) = self.limiter(key) {
            return limiter;
        }

        // The entry guard holds the shard lock across the check and the insert
        let mut created = false;
        let limiter = Arc::clone(
            self.limiters
                .entry(key.to_string())
                .or_insert_with(|| {
                    created = true;
                    let rate = rule.refill_rate();
                    debug!(
                        key = %key,
                        rate = ?rate,
                        burst = rule.burst,
                        unit = %rule.unit,
                        "Creating new limiter"
                    );
                    Arc::new(TokenBucket::new_at(rate, rule.burst, now))
                })
                .value(),
        );

        if created {
            self.warn_on_growth();
        }
        limiter
    }

    fn warn_on_growth(&self) {
        if let Some(threshold) = self.key_warning_threshold {
            let count = self.limiters.len();
            if count % threshold == 0 {
                warn!(
                    keys = count,
                    threshold = threshold,
                    "Limiter key count keeps growing; keys are never evicted"
                );
            }
        }
    }
}

impl Default for KeyedLimiterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
