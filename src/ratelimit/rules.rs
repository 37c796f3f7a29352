//! Rate limit rules and rule-string parsing.
//!
//! Rules are written the way operators think about them: `"10/second"`,
//! `"10 per second"`, `"100 per 2 minutes"`. Several rules may share one
//! string when separated by `;`, `,` or `|`. Strings are parsed once when the
//! configuration is loaded; the limiter only ever sees [`LimitRule`] values.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TurnstileError};

/// Time unit for rate limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
    Month,
    Year,
}

/// Longest window a rule may span. Stores keep expiries in signed milliseconds.
const MAX_WINDOW_SECS: u64 = i64::MAX as u64 / 1000;

impl TimeUnit {
    fn seconds(&self) -> u64 {
        match self {
            TimeUnit::Second => 1,
            TimeUnit::Minute => 60,
            TimeUnit::Hour => 3600,
            TimeUnit::Day => 86400,
            TimeUnit::Month => 30 * 86400,
            TimeUnit::Year => 365 * 86400,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeUnit::Second => "second",
            TimeUnit::Minute => "minute",
            TimeUnit::Hour => "hour",
            TimeUnit::Day => "day",
            TimeUnit::Month => "month",
            TimeUnit::Year => "year",
        }
    }

    fn from_word(word: &str) -> Option<Self> {
        let word = word.strip_suffix('s').unwrap_or(word);
        match word {
            "second" => Some(TimeUnit::Second),
            "minute" => Some(TimeUnit::Minute),
            "hour" => Some(TimeUnit::Hour),
            "day" => Some(TimeUnit::Day),
            "month" => Some(TimeUnit::Month),
            "year" => Some(TimeUnit::Year),
            _ => None,
        }
    }
}

/// A single quota: `amount` requests per `multiples` × `unit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LimitRule {
    /// Number of requests allowed per window
    pub amount: u64,
    /// How many units make up one window
    pub multiples: u64,
    /// The time unit
    pub unit: TimeUnit,
}

impl LimitRule {
    /// Create a rule of `amount` requests per single `unit`.
    pub fn new(amount: u64, unit: TimeUnit) -> Self {
        Self {
            amount,
            multiples: 1,
            unit,
        }
    }

    /// Create a rule of `amount` requests per `multiples` units.
    pub fn per(amount: u64, multiples: u64, unit: TimeUnit) -> Self {
        Self {
            amount,
            multiples,
            unit,
        }
    }

    /// Length of one window for this rule.
    ///
    /// Parsed rules never exceed `MAX_WINDOW_SECS`; hand-built ones saturate.
    pub fn window(&self) -> Duration {
        Duration::from_secs(
            self.unit
                .seconds()
                .saturating_mul(self.multiples)
                .min(MAX_WINDOW_SECS),
        )
    }

    /// Storage key segment that distinguishes this rule from any other rule
    /// applied to the same client key.
    pub fn key_suffix(&self) -> String {
        format!("{}/{}/{}", self.amount, self.multiples, self.unit.as_str())
    }
}

impl fmt::Display for LimitRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} per {} {}",
            self.amount,
            self.multiples,
            self.unit.as_str()
        )
    }
}

impl FromStr for LimitRule {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self> {
        let mut rules = parse_many(s)?;
        match rules.len() {
            1 => Ok(rules.remove(0)),
            n => Err(TurnstileError::Config(format!(
                "expected a single rate limit in {:?}, found {}",
                s, n
            ))),
        }
    }
}

/// Parse a string holding one or more rules separated by `;`, `,` or `|`.
pub fn parse_many(s: &str) -> Result<Vec<LimitRule>> {
    let rules = s
        .split([';', ',', '|'])
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(parse_one)
        .collect::<Result<Vec<_>>>()?;

    if rules.is_empty() {
        return Err(TurnstileError::Config(format!(
            "no rate limit found in {:?}",
            s
        )));
    }

    Ok(rules)
}

/// Parse and flatten a list of rule strings, as found in configuration.
pub fn parse_list<S: AsRef<str>>(items: &[S]) -> Result<Vec<LimitRule>> {
    let mut rules = Vec::new();
    for item in items {
        for rule in parse_many(item.as_ref())? {
            if !rules.contains(&rule) {
                rules.push(rule);
            }
        }
    }
    Ok(rules)
}

fn parse_one(raw: &str) -> Result<LimitRule> {
    let invalid = || TurnstileError::Config(format!("invalid rate limit string {:?}", raw));

    let lowered = raw.to_ascii_lowercase();
    let (amount, rest) = if let Some((amount, rest)) = lowered.split_once('/') {
        (amount.trim().to_string(), rest.trim().to_string())
    } else {
        let mut words = lowered.split_whitespace();
        let amount = words.next().ok_or_else(invalid)?.to_string();
        if words.next() != Some("per") {
            return Err(invalid());
        }
        (amount, words.collect::<Vec<_>>().join(" "))
    };

    let amount: u64 = amount.parse().map_err(|_| invalid())?;

    let mut words = rest.split_whitespace();
    let first = words.next().ok_or_else(invalid)?;
    let (multiples, unit_word) = match first.parse::<u64>() {
        Ok(n) => (n, words.next().ok_or_else(invalid)?),
        Err(_) => (1, first),
    };
    if words.next().is_some() {
        return Err(invalid());
    }

    let unit = TimeUnit::from_word(unit_word).ok_or_else(invalid)?;
    if amount == 0 || multiples == 0 {
        return Err(invalid());
    }
    match unit.seconds().checked_mul(multiples) {
        Some(secs) if secs <= MAX_WINDOW_SECS => {}
        _ => {
            return Err(TurnstileError::Config(format!(
                "rate limit window too long in {:?}",
                raw
            )))
        }
    }

    Ok(LimitRule::per(amount, multiples, unit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_slash_form() {
        let rule: LimitRule = "10/second".parse().unwrap();
        assert_eq!(rule, LimitRule::new(10, TimeUnit::Second));
        assert_eq!(rule.window(), Duration::from_secs(1));
    }

    #[test]
    fn test_parse_per_form() {
        let rule: LimitRule = "10 per second".parse().unwrap();
        assert_eq!(rule, LimitRule::new(10, TimeUnit::Second));

        let rule: LimitRule = "100 per 2 minutes".parse().unwrap();
        assert_eq!(rule, LimitRule::per(100, 2, TimeUnit::Minute));
        assert_eq!(rule.window(), Duration::from_secs(120));
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        let rule: LimitRule = "5 PER Hour".parse().unwrap();
        assert_eq!(rule, LimitRule::new(5, TimeUnit::Hour));
    }

    #[test]
    fn test_parse_many_separators() {
        let rules = parse_many("5/minute; 50/hour, 1000 per day").unwrap();
        assert_eq!(
            rules,
            vec![
                LimitRule::new(5, TimeUnit::Minute),
                LimitRule::new(50, TimeUnit::Hour),
                LimitRule::new(1000, TimeUnit::Day),
            ]
        );
    }

    #[test]
    fn test_parse_list_deduplicates() {
        let rules = parse_list(&["10/second", "10 per second", "1/day"]).unwrap();
        assert_eq!(rules.len(), 2);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for raw in ["", "ten/second", "10/fortnight", "10 second", "0/second", "10/0 seconds", "10/2 3 minutes"] {
            assert!(
                matches!(parse_many(raw), Err(TurnstileError::Config(_))),
                "{:?} should be rejected",
                raw
            );
        }
    }

    #[test]
    fn test_single_rule_from_str_rejects_lists() {
        assert!("1/second;2/minute".parse::<LimitRule>().is_err());
    }

    #[test]
    fn test_display_and_key_suffix() {
        let rule = LimitRule::per(100, 2, TimeUnit::Minute);
        assert_eq!(rule.to_string(), "100 per 2 minute");
        assert_eq!(rule.key_suffix(), "100/2/minute");
    }

    #[test]
    fn test_unit_windows() {
        assert_eq!(LimitRule::new(1, TimeUnit::Hour).window(), Duration::from_secs(3600));
        assert_eq!(LimitRule::new(1, TimeUnit::Day).window(), Duration::from_secs(86400));
        assert_eq!(LimitRule::new(1, TimeUnit::Month).window(), Duration::from_secs(30 * 86400));
        assert_eq!(LimitRule::new(1, TimeUnit::Year).window(), Duration::from_secs(365 * 86400));
    }

    #[test]
    fn test_overlong_window_is_configuration_error() {
        for raw in ["1 per 600000000000000 years", "1/18446744073709551615 seconds"] {
            assert!(
                matches!(raw.parse::<LimitRule>(), Err(TurnstileError::Config(_))),
                "{:?} should be rejected",
                raw
            );
        }
        assert!("1 per 1000 years".parse::<LimitRule>().is_ok());
    }

    #[test]
    fn test_hand_built_window_saturates() {
        let rule = LimitRule::per(1, u64::MAX, TimeUnit::Year);
        assert_eq!(rule.window(), Duration::from_secs(MAX_WINDOW_SECS));
    }
}
