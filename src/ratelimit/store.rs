//! Counter store abstraction shared by the Redis adapter and the in-memory
//! fallback.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use super::key::RateLimitKey;
use super::rules::LimitRule;
use crate::error::StoreError;

/// Which store produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterSource {
    /// The shared, network-accessible store
    Shared,
    /// The process-local fallback counter
    Fallback,
}

impl CounterSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CounterSource::Shared => "shared",
            CounterSource::Fallback => "fallback",
        }
    }
}

/// State of one counter right after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowStats {
    /// Hits recorded in the current window, including this one
    pub count: u64,
    /// When the current window expires
    pub reset_at: DateTime<Utc>,
}

/// Outcome of checking one request against a set of rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Ceiling of the reported rule
    pub limit: u64,
    /// Requests left in the reported rule's window
    pub remaining: u64,
    /// When the reported rule's window resets
    pub reset_at: DateTime<Utc>,
    /// How long a rejected client should wait; zero when allowed
    pub retry_after: Duration,
    /// The rule this decision reports on
    pub rule: LimitRule,
    /// The store that answered
    pub source: CounterSource,
    /// Detail registered for the rejecting limit, replacing the rule text
    pub error_message: Option<String>,
}

impl Decision {
    fn from_stats(rule: LimitRule, stats: WindowStats, source: CounterSource) -> Self {
        let allowed = stats.count <= rule.amount;
        let retry_after = if allowed {
            Duration::ZERO
        } else {
            (stats.reset_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .max(Duration::from_millis(1))
        };

        Self {
            allowed,
            limit: rule.amount,
            remaining: rule.amount.saturating_sub(stats.count),
            reset_at: stats.reset_at,
            retry_after,
            rule,
            source,
            error_message: None,
        }
    }

    /// Whether this admitted decision is closer to rejecting than `other`:
    /// fewer remaining, then earlier reset.
    fn is_more_restrictive_than(&self, other: &Decision) -> bool {
        (self.remaining, self.reset_at) < (other.remaining, other.reset_at)
    }
}

/// The end of a window of length `expiry` starting at `start`.
pub(crate) fn window_end(start: DateTime<Utc>, expiry: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(expiry)
        .ok()
        .and_then(|expiry| start.checked_add_signed(expiry))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// One counter increment within a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterHit {
    /// Storage key of the counter
    pub key: String,
    /// Window length used when the counter is new
    pub expiry: Duration,
    /// Count above which the hit rejects and the batch stops
    pub limit: u64,
}

/// A store of fixed-window counters.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Which source this store represents in decisions.
    fn source(&self) -> CounterSource;

    /// Apply `hits` in order as a single atomic operation.
    ///
    /// Each hit adds `amount` to its counter, starting a new window if none
    /// is active. The batch stops after the first hit whose count exceeds its
    /// limit, so later counters are left untouched. Returns the state of every
    /// applied hit. An error means nothing was applied.
    async fn incr_many(
        &self,
        hits: &[CounterHit],
        amount: u64,
    ) -> Result<Vec<WindowStats>, StoreError>;

    /// Add `amount` to the counter named `key`.
    async fn incr(&self, key: &str, expiry: Duration, amount: u64)
        -> Result<WindowStats, StoreError> {
        let hit = CounterHit {
            key: key.to_string(),
            expiry,
            limit: u64::MAX,
        };
        self.incr_many(std::slice::from_ref(&hit), amount)
            .await?
            .pop()
            .ok_or_else(|| StoreError::Unavailable("store applied no increment".to_string()))
    }

    /// Whether the store is currently reachable.
    async fn check(&self) -> bool;

    /// Drop every counter held by the store.
    async fn reset(&self) -> Result<(), StoreError>;
}

/// Check every `(key, rule)` pair in one atomic store call, charging `cost`.
///
/// Pairs are evaluated in order and evaluation stops at the first rejection,
/// whose decision is returned. When every pair admits, the most restrictive
/// decision is returned. Returns the index of the reported pair with its
/// decision, or `None` when `checks` is empty.
pub async fn check_rules<S>(
    store: &S,
    checks: &[(&RateLimitKey, LimitRule)],
    cost: u64,
) -> Result<Option<(usize, Decision)>, StoreError>
where
    S: CounterStore + ?Sized,
{
    if checks.is_empty() {
        return Ok(None);
    }

    let hits: Vec<CounterHit> = checks
        .iter()
        .map(|(key, rule)| CounterHit {
            key: key.storage_key(rule),
            expiry: rule.window(),
            limit: rule.amount,
        })
        .collect();

    let applied = store.incr_many(&hits, cost).await?;
    let applied_count = applied.len();
    if applied_count == 0 || applied_count > hits.len() {
        return Err(StoreError::Unavailable(format!(
            "store applied {} of {} increments",
            applied_count,
            hits.len()
        )));
    }

    let source = store.source();
    let mut reported: Option<(usize, Decision)> = None;

    for (index, (stats, hit)) in applied.into_iter().zip(&hits).enumerate() {
        let (key, rule) = checks[index];
        let decision = Decision::from_stats(rule, stats, source);

        trace!(
            key = %hit.key,
            count = stats.count,
            limit = rule.amount,
            source = source.as_str(),
            "Counter incremented"
        );

        if !decision.allowed {
            debug!(key = %key, rule = %rule, "Rate limit exceeded");
            return Ok(Some((index, decision)));
        }

        let keep_current = matches!(
            &reported,
            Some((_, current)) if !decision.is_more_restrictive_than(current)
        );
        if !keep_current {
            reported = Some((index, decision));
        }
    }

    if applied_count < hits.len() {
        return Err(StoreError::Unavailable(format!(
            "store stopped after {} of {} increments without a rejection",
            applied_count,
            hits.len()
        )));
    }

    Ok(reported)
}

/// Check `key` against every rule in `rules`, charging `cost` to each.
///
/// Returns `None` when `rules` is empty.
pub async fn check_and_increment<S>(
    store: &S,
    key: &RateLimitKey,
    rules: &[LimitRule],
    cost: u64,
) -> Result<Option<Decision>, StoreError>
where
    S: CounterStore + ?Sized,
{
    let checks: Vec<(&RateLimitKey, LimitRule)> = rules.iter().map(|rule| (key, *rule)).collect();
    Ok(check_rules(store, &checks, cost)
        .await?
        .map(|(_, decision)| decision))
}
