//! Rate limiting logic and state management.

mod bucket;
mod key;
mod limiter;
mod parser;
mod rules;

pub use bucket::{Rate, RetryAfter, TimeUnit, TokenBucket};
pub use key::{build_key, KEY_SEPARATOR};
pub use limiter::KeyedLimiterRegistry;
pub use rules::{RateRule, RuleSet, Whitelist, WhitelistScope, ALL_RESOURCES, ANY_METHOD};
