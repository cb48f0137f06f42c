//! Token bucket implementation.

use parking_lot::Mutex;
use std::fmt;
use std::time::{Duration, Instant};

/// Time unit a rule's quota is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeUnit {
    /// Per-second quota
    Second,
    /// Per-minute quota
    Minute,
    /// Per-hour quota
    Hour,
    /// Per-day quota
    Day,
    /// Per-week quota
    Week,
}

const UNIT_TABLE: [(&str, TimeUnit); 5] = [
    ("second", TimeUnit::Second),
    ("minute", TimeUnit::Minute),
    ("hour", TimeUnit::Hour),
    ("day", TimeUnit::Day),
    ("week", TimeUnit::Week),
];

impl TimeUnit {
    /// Look up a unit by its configuration name.
    ///
    /// Names are matched exactly; `None` means the unit is unrecognized.
    pub fn from_name(name: &str) -> Option<Self> {
        UNIT_TABLE
            .iter()
            .find(|(candidate, _)| *candidate == name)
            .map(|(_, unit)| *unit)
    }

    /// Get the duration of this time unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86_400),
            TimeUnit::Week => Duration::from_secs(604_800),
        }
    }
}

/// Refill rate of a bucket, resolved once when the bucket is created.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rate {
    /// Tokens added per second
    PerSecond(f64),
    /// No limit; every request is admitted
    Unlimited,
}

impl Rate {
    /// Derive the refill rate for `rate` requests per `unit`.
    ///
    /// An unrecognized unit yields [`Rate::Unlimited`].
    pub fn from_quota(rate: i64, unit: &str) -> Self {
        match TimeUnit::from_name(unit) {
            Some(unit) => Rate::PerSecond(rate as f64 / unit.duration().as_secs_f64()),
            None => Rate::Unlimited,
        }
    }
}

/// How long a caller should wait before a request would be admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAfter {
    /// The request would be admitted after this delay
    After(Duration),
    /// The request can never be admitted at this size
    Never,
}

impl RetryAfter {
    /// The delay, if the request can eventually succeed.
    pub fn duration(&self) -> Option<Duration> {
        match self {
            RetryAfter::After(delay) => Some(*delay),
            RetryAfter::Never => None,
        }
    }

    /// The delay in whole seconds, rounded up, as used by `Retry-After`.
    pub fn as_secs_ceil(&self) -> Option<u64> {
        self.duration().map(|delay| {
            let secs = delay.as_secs();
            if delay.subsec_nanos() > 0 {
                secs + 1
            } else {
                secs
            }
        })
    }
}

impl fmt::Display for RetryAfter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryAfter::After(delay) => write!(f, "{:?}", delay),
            RetryAfter::Never => write!(f, "never"),
        }
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last: Instant,
}

impl BucketState {
    /// Token count at `now`, without recording the refill.
    fn refilled(&self, now: Instant, per_second: f64, capacity: f64) -> f64 {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        (self.tokens + elapsed * per_second).min(capacity)
    }
}

/// A continuously refilling token bucket.
///
/// The bucket starts full. Its state sits behind its own lock so that
/// callers sharing a bucket never contend with callers on other buckets.
#[derive(Debug)]
pub struct TokenBucket {
    rate: Rate,
    burst: i64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(rate: Rate, burst: i64) -> Self {
        Self::new_at(rate, burst, Instant::now())
    }

    /// Create a full bucket whose refill clock starts at `now`.
    pub fn new_at(rate: Rate, burst: i64, now: Instant) -> Self {
        Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                last: now,
            }),
        }
    }

    /// The refill rate of this bucket.
    pub fn rate(&self) -> Rate {
        self.rate
    }

    /// The capacity of this bucket.
    pub fn burst(&self) -> i64 {
        self.burst
    }

    /// Tokens available at `now`.
    pub fn tokens_at(&self, now: Instant) -> f64 {
        match self.rate {
            Rate::Unlimited => f64::INFINITY,
            Rate::PerSecond(per_second) => {
                self.state
                    .lock()
                    .refilled(now, per_second, self.burst as f64)
            }
        }
    }

    /// Take `n` tokens at `now` if they are all available.
    ///
    /// Returns `false` without consuming anything when fewer than `n`
    /// tokens are available.
    pub fn allow_n_at(&self, n: u32, now: Instant) -> bool {
        let per_second = match self.rate {
            Rate::Unlimited => return true,
            Rate::PerSecond(per_second) => per_second,
        };

        let mut state = self.state.lock();
        let tokens = state.refilled(now, per_second, self.burst as f64);
        if now > state.last {
            state.last = now;
        }

        let cost = f64::from(n);
        if tokens >= cost {
            state.tokens = tokens - cost;
            true
        } else {
            state.tokens = tokens;
            false
        }
    }

    /// Compute the wait a reservation of `n` tokens made at `now` would
    /// incur. The reservation is rolled back before the lock is released,
    /// so the bucket is left exactly as it was.
    pub fn reserve_n_at(&self, n: u32, now: Instant) -> RetryAfter {
        let per_second = match self.rate {
            Rate::Unlimited => return RetryAfter::After(Duration::ZERO),
            Rate::PerSecond(per_second) => per_second,
        };

        let cost = i64::from(n);
        if cost > self.burst {
            return RetryAfter::Never;
        }

        let tokens = self
            .state
            .lock()
            .refilled(now, per_second, self.burst as f64);
        let deficit = cost as f64 - tokens;
        if deficit <= 0.0 {
            return RetryAfter::After(Duration::ZERO);
        }
        if per_second <= 0.0 {
            return RetryAfter::Never;
        }

        Duration::try_from_secs_f64(deficit / per_second)
            .map(RetryAfter::After)
            .unwrap_or(RetryAfter::Never)
    }
}
