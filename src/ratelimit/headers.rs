//! Translation of limiter decisions into response headers.

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use super::store::Decision;

pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RESET_HEADER: &str = "x-ratelimit-reset";
pub const RETRY_AFTER_HEADER: &str = "retry-after";

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// How the `Retry-After` value is written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetryAfterStyle {
    /// An HTTP date, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`
    HttpDate,
    /// Whole seconds to wait
    #[default]
    DeltaSeconds,
}

/// Rate limit metadata for one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: u64,
    pub remaining: u64,
    /// Unix timestamp of the window reset
    pub reset: i64,
    /// Present only when the request was rejected
    pub retry_after: Option<String>,
}

impl RateLimitHeaders {
    /// Build the headers describing `decision`.
    pub fn from_decision(decision: &Decision, style: RetryAfterStyle) -> Self {
        let retry_after = (!decision.allowed).then(|| match style {
            RetryAfterStyle::HttpDate => decision.reset_at.format(HTTP_DATE_FORMAT).to_string(),
            RetryAfterStyle::DeltaSeconds => {
                let secs = decision.retry_after.as_secs_f64().ceil() as u64;
                secs.max(1).to_string()
            }
        });

        Self {
            limit: decision.limit,
            remaining: decision.remaining,
            reset: decision.reset_at.timestamp(),
            retry_after,
        }
    }

    /// Header name/value pairs in write order.
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            (LIMIT_HEADER, self.limit.to_string()),
            (REMAINING_HEADER, self.remaining.to_string()),
            (RESET_HEADER, self.reset.to_string()),
        ];
        if let Some(ref retry_after) = self.retry_after {
            pairs.push((RETRY_AFTER_HEADER, retry_after.clone()));
        }
        pairs
    }

    /// Write the headers into `headers`, replacing any previous values.
    pub fn apply(&self, headers: &mut HeaderMap) {
        for (name, value) in self.pairs() {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(HeaderName::from_static(name), value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::rules::{LimitRule, TimeUnit};
    use crate::ratelimit::store::CounterSource;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn decision(allowed: bool, retry_after: Duration) -> Decision {
        Decision {
            allowed,
            limit: 10,
            remaining: if allowed { 4 } else { 0 },
            reset_at: Utc.with_ymd_and_hms(1994, 11, 6, 8, 49, 37).unwrap(),
            retry_after,
            rule: LimitRule::new(10, TimeUnit::Second),
            source: CounterSource::Shared,
            error_message: None,
        }
    }

    #[test]
    fn test_allowed_has_no_retry_after() {
        let headers = RateLimitHeaders::from_decision(&decision(true, Duration::ZERO), RetryAfterStyle::DeltaSeconds);
        assert_eq!(headers.limit, 10);
        assert_eq!(headers.remaining, 4);
        assert_eq!(headers.reset, 784111777);
        assert_eq!(headers.retry_after, None);
        assert_eq!(headers.pairs().len(), 3);
    }

    #[test]
    fn test_delta_seconds_rounds_up() {
        let headers = RateLimitHeaders::from_decision(
            &decision(false, Duration::from_millis(1200)),
            RetryAfterStyle::DeltaSeconds,
        );
        assert_eq!(headers.retry_after.as_deref(), Some("2"));

        let headers = RateLimitHeaders::from_decision(
            &decision(false, Duration::from_millis(1)),
            RetryAfterStyle::DeltaSeconds,
        );
        assert_eq!(headers.retry_after.as_deref(), Some("1"));
    }

    #[test]
    fn test_http_date() {
        let headers = RateLimitHeaders::from_decision(
            &decision(false, Duration::from_secs(1)),
            RetryAfterStyle::HttpDate,
        );
        assert_eq!(
            headers.retry_after.as_deref(),
            Some("Sun, 06 Nov 1994 08:49:37 GMT")
        );
    }

    #[test]
    fn test_apply_writes_header_map() {
        let headers = RateLimitHeaders::from_decision(
            &decision(false, Duration::from_secs(1)),
            RetryAfterStyle::DeltaSeconds,
        );
        let mut map = HeaderMap::new();
        headers.apply(&mut map);

        assert_eq!(map.get("X-RateLimit-Limit").unwrap(), "10");
        assert_eq!(map.get("X-RateLimit-Remaining").unwrap(), "0");
        assert_eq!(map.get("Retry-After").unwrap(), "1");
    }

    #[test]
    fn test_style_deserializes_from_config_names() {
        let style: RetryAfterStyle = serde_yaml::from_str("http-date").unwrap();
        assert_eq!(style, RetryAfterStyle::HttpDate);
        let style: RetryAfterStyle = serde_yaml::from_str("delta-seconds").unwrap();
        assert_eq!(style, RetryAfterStyle::DeltaSeconds);
    }
}
