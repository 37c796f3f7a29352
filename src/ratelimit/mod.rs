//! Rate limiting logic and state management.

mod headers;
mod key;
mod limiter;
mod memory;
mod redis;
mod rules;
mod store;

pub use headers::{RateLimitHeaders, RetryAfterStyle};
pub use key::{KeyStyle, RateLimitKey, RequestInfo, GLOBAL_SCOPE};
pub use limiter::{Admission, ExemptWhen, LimitOptions, RateLimiter};
pub use memory::MemoryStore;
pub use self::redis::RedisStore;
pub use rules::{parse_list, parse_many, LimitRule, TimeUnit};
pub use store::{
    check_and_increment, check_rules, CounterHit, CounterSource, CounterStore, Decision,
    WindowStats,
};
