//! Core rate limiter implementation.
//!
//! The limiter decides, for each request, which counter source is
//! authoritative (the shared store or the in-memory fallback), which rules
//! apply, and whether the request is admitted. Exactly one source is consulted
//! for any decision it reports.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use super::key::{RateLimitKey, RequestInfo, GLOBAL_SCOPE};
use super::memory::MemoryStore;
use super::redis::RedisStore;
use super::rules::{parse_many, LimitRule};
use super::store::{check_rules, CounterStore, Decision};
use crate::config::{FailureMode, LimiterConfig, StorageBackend};
use crate::error::{Result, StoreError, TurnstileError};

/// Recovery attempts back off as 2^n seconds; n wraps after this many.
const MAX_BACKEND_CHECKS: u32 = 5;

/// Result of running a request through the limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// No limit applied: limiting disabled, route exempt, no rules, or the
    /// storage failed and errors are swallowed.
    Unlimited,
    /// Rules were checked; see [`Decision::allowed`].
    Checked(Decision),
}

impl Admission {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        match self {
            Admission::Unlimited => true,
            Admission::Checked(decision) => decision.allowed,
        }
    }

    pub fn decision(&self) -> Option<&Decision> {
        match self {
            Admission::Unlimited => None,
            Admission::Checked(decision) => Some(decision),
        }
    }
}

/// Predicate deciding whether a limit is skipped for a request.
pub type ExemptWhen = Arc<dyn Fn(&RequestInfo) -> bool + Send + Sync>;

/// Options for a route limit.
///
/// ```rust,ignore
/// limiter.limit_with(
///     "/members",
///     "5/minute",
///     LimitOptions::new()
///         .methods(&["POST"])
///         .error_message("Too many sign-ups"),
/// )?;
/// ```
#[derive(Clone)]
pub struct LimitOptions {
    /// Shared scope name; `None` counts per route
    scope: Option<String>,
    /// Whether these limits replace the default limits for the route
    override_defaults: bool,
    /// Count each HTTP method in its own bucket
    per_method: bool,
    /// Upper-case methods the limit applies to; empty means all
    methods: Vec<String>,
    error_message: Option<String>,
    exempt_when: Option<ExemptWhen>,
}

impl LimitOptions {
    /// Options replacing the default limits, counted per route.
    pub fn new() -> Self {
        Self {
            scope: None,
            override_defaults: true,
            per_method: false,
            methods: Vec::new(),
            error_message: None,
            exempt_when: None,
        }
    }

    /// Count under `scope`, shared by every route registered with it.
    pub fn shared(mut self, scope: &str) -> Self {
        self.scope = Some(scope.to_string());
        self
    }

    pub fn override_defaults(mut self, override_defaults: bool) -> Self {
        self.override_defaults = override_defaults;
        self
    }

    /// Count each HTTP method separately.
    pub fn per_method(mut self) -> Self {
        self.per_method = true;
        self
    }

    /// Only apply the limit to `methods`.
    pub fn methods(mut self, methods: &[&str]) -> Self {
        self.methods = methods.iter().map(|m| m.to_ascii_uppercase()).collect();
        self
    }

    /// Send `message` instead of the rule when this limit rejects.
    pub fn error_message(mut self, message: &str) -> Self {
        self.error_message = Some(message.to_string());
        self
    }

    /// Skip the limit for requests matching `predicate`.
    pub fn exempt_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&RequestInfo) -> bool + Send + Sync + 'static,
    {
        self.exempt_when = Some(Arc::new(predicate));
        self
    }
}

impl Default for LimitOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Limits registered for one route.
#[derive(Clone)]
struct RouteLimit {
    rules: Vec<LimitRule>,
    options: LimitOptions,
}

impl RouteLimit {
    fn applies_to(&self, request: &RequestInfo) -> bool {
        if !self.options.methods.is_empty() && !self.options.methods.contains(&request.method) {
            return false;
        }
        match &self.options.exempt_when {
            Some(exempt) => !exempt(request),
            None => true,
        }
    }

    fn scope(&self, route_scope: &str, request: &RequestInfo) -> String {
        let scope = self.options.scope.as_deref().unwrap_or(route_scope);
        if self.options.per_method {
            format!("{}:{}", scope, request.method)
        } else {
            scope.to_string()
        }
    }
}

/// Failure handling resolved from configuration.
enum FailurePolicy {
    Fallback(MemoryStore),
    FailOpen,
    FailClosed,
}

/// Exponential backoff between attempts to leave degraded mode.
struct RecoveryBackoff {
    attempts: u32,
    last: Instant,
}

impl RecoveryBackoff {
    fn new() -> Self {
        Self {
            attempts: 0,
            last: Instant::now(),
        }
    }

    fn restart(&mut self) {
        *self = Self::new();
    }

    fn due(&mut self) -> bool {
        if self.attempts > MAX_BACKEND_CHECKS {
            self.attempts = 0;
        }
        if self.last.elapsed() > Duration::from_secs(1 << self.attempts) {
            self.last = Instant::now();
            self.attempts += 1;
            return true;
        }
        false
    }
}

/// Rules counted against one key.
struct PlanEntry<'a> {
    key: RateLimitKey,
    rules: &'a [LimitRule],
    error_message: Option<&'a str>,
}

impl<'a> PlanEntry<'a> {
    fn new(key: RateLimitKey, rules: &'a [LimitRule]) -> Self {
        Self {
            key,
            rules,
            error_message: None,
        }
    }
}

type Plan<'a> = Vec<PlanEntry<'a>>;

/// The limiter engine.
///
/// Thread-safe; share it behind an `Arc`. Route limits are registered with
/// `&mut self` before the limiter is shared.
pub struct RateLimiter {
    config: LimiterConfig,
    /// The shared counter store
    store: Arc<dyn CounterStore>,
    policy: FailurePolicy,
    /// Set while the shared store is considered unreachable
    storage_dead: AtomicBool,
    recovery: Mutex<RecoveryBackoff>,
    route_limits: HashMap<String, Vec<RouteLimit>>,
    exempt_routes: HashSet<String>,
}

impl RateLimiter {
    /// Create a limiter with the store described by `config.storage`.
    pub fn from_config(config: LimiterConfig) -> Result<Self> {
        let store: Arc<dyn CounterStore> = match &config.storage {
            StorageBackend::Memory => Arc::new(MemoryStore::shared()),
            StorageBackend::Redis(uri) => Arc::new(RedisStore::new(uri, config.store_timeout)?),
        };
        Ok(Self::with_store(config, store))
    }

    /// Create a limiter on top of an existing shared store.
    pub fn with_store(config: LimiterConfig, store: Arc<dyn CounterStore>) -> Self {
        let policy = match config.failure_mode {
            FailureMode::Fallback => FailurePolicy::Fallback(MemoryStore::new()),
            FailureMode::FailOpen => FailurePolicy::FailOpen,
            FailureMode::FailClosed => FailurePolicy::FailClosed,
        };

        info!(
            enabled = config.enabled,
            failure_mode = ?config.failure_mode,
            key_style = ?config.key_style,
            default_limits = config.default_limits.len(),
            application_limits = config.application_limits.len(),
            "Rate limiter initialized"
        );

        Self {
            config,
            store,
            policy,
            storage_dead: AtomicBool::new(false),
            recovery: Mutex::new(RecoveryBackoff::new()),
            route_limits: HashMap::new(),
            exempt_routes: HashSet::new(),
        }
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Limit `route` with `limits`, replacing the default limits for it.
    pub fn limit(&mut self, route: &str, limits: &str) -> Result<()> {
        self.limit_with(route, limits, LimitOptions::new())
    }

    /// Limit `route` with `limits` in addition to the default limits.
    pub fn limit_with_defaults(&mut self, route: &str, limits: &str) -> Result<()> {
        self.limit_with(route, limits, LimitOptions::new().override_defaults(false))
    }

    /// Apply `limits` to all of `routes` with one counter shared under `scope`.
    pub fn shared_limit(&mut self, routes: &[&str], scope: &str, limits: &str) -> Result<()> {
        if scope.is_empty() {
            return Err(TurnstileError::Config(
                "shared limit scope must not be empty".to_string(),
            ));
        }
        for route in routes {
            self.limit_with(route, limits, LimitOptions::new().shared(scope))?;
        }
        Ok(())
    }

    /// Limit `route` with `limits` under `options`.
    pub fn limit_with(&mut self, route: &str, limits: &str, options: LimitOptions) -> Result<()> {
        let rules = parse_many(limits)?;
        debug!(
            route = %route,
            limits = %limits,
            per_method = options.per_method,
            "Registering route limit"
        );
        self.route_limits
            .entry(route.to_string())
            .or_default()
            .push(RouteLimit { rules, options });
        Ok(())
    }

    /// Never limit `route`.
    pub fn exempt(&mut self, route: &str) {
        self.exempt_routes.insert(route.to_string());
    }

    /// Whether requests are currently counted by the in-memory fallback.
    pub fn is_degraded(&self) -> bool {
        self.storage_dead.load(Ordering::SeqCst)
    }

    /// Check one request costing a single hit.
    pub async fn check(&self, request: &RequestInfo) -> Result<Admission> {
        self.check_with_cost(request, 1).await
    }

    /// Check one request costing `cost` hits.
    ///
    /// Storage failures never escape unless the failure mode is fail-closed.
    pub async fn check_with_cost(&self, request: &RequestInfo, cost: u64) -> Result<Admission> {
        if !self.config.enabled
            || self.exempt_routes.contains(request.route())
            || request.scope_for(self.config.key_style).is_empty()
        {
            return Ok(Admission::Unlimited);
        }

        trace!(
            client = %request.client,
            path = %request.path,
            endpoint = ?request.endpoint,
            "Checking rate limit"
        );

        if let FailurePolicy::Fallback(fallback) = &self.policy {
            if self.is_degraded() && !self.try_recover().await {
                return self.check_fallback(fallback, request, cost).await;
            }
        }

        let plan = self.shared_plan(request);
        match evaluate(self.store.as_ref(), &plan, cost).await {
            Ok(admission) => {
                record(&admission);
                Ok(admission)
            }
            Err(err) => {
                counter!("turnstile_store_errors_total").increment(1);
                match &self.policy {
                    FailurePolicy::Fallback(fallback) => {
                        self.enter_degraded(&err);
                        self.check_fallback(fallback, request, cost).await
                    }
                    FailurePolicy::FailOpen => {
                        error!(error = %err, "Failed to rate limit. Swallowing error");
                        Ok(Admission::Unlimited)
                    }
                    FailurePolicy::FailClosed => {
                        error!(error = %err, "Failed to rate limit");
                        Err(TurnstileError::StoreUnavailable(err))
                    }
                }
            }
        }
    }

    async fn check_fallback(
        &self,
        fallback: &MemoryStore,
        request: &RequestInfo,
        cost: u64,
    ) -> Result<Admission> {
        let plan = self.fallback_plan(request);
        let admission = evaluate(fallback, &plan, cost).await?;
        record(&admission);
        Ok(admission)
    }

    /// Ping the shared store if an attempt is due; returns true if it is back.
    async fn try_recover(&self) -> bool {
        let due = self.recovery.lock().due();
        if !due {
            return false;
        }

        if self.store.check().await {
            info!("Rate limit storage recovered");
            self.storage_dead.store(false, Ordering::SeqCst);
            self.recovery.lock().restart();
            true
        } else {
            debug!("Rate limit storage still unreachable");
            false
        }
    }

    fn enter_degraded(&self, err: &StoreError) {
        if !self.storage_dead.swap(true, Ordering::SeqCst) {
            self.recovery.lock().restart();
            warn!(
                error = %err,
                "Rate limit storage unreachable - falling back to in-memory storage"
            );
            counter!("turnstile_degraded_total").increment(1);
        }
    }

    fn key(&self, request: &RequestInfo, scope: &str) -> RateLimitKey {
        RateLimitKey::new(&self.config.key_prefix, &request.client, scope)
    }

    /// Application limits, then route limits, then default limits unless a
    /// route limit overrides them.
    fn shared_plan(&self, request: &RequestInfo) -> Plan<'_> {
        let scope = request.scope_for(self.config.key_style);
        let mut plan: Plan<'_> = Vec::new();

        if !self.config.application_limits.is_empty() {
            plan.push(PlanEntry::new(
                self.key(request, GLOBAL_SCOPE),
                &self.config.application_limits,
            ));
        }

        let mut apply_defaults = true;
        if let Some(routes) = self.route_limits.get(request.route()) {
            for route in routes.iter().filter(|route| route.applies_to(request)) {
                plan.push(PlanEntry {
                    key: self.key(request, &route.scope(scope, request)),
                    rules: &route.rules,
                    error_message: route.options.error_message.as_deref(),
                });
            }
            apply_defaults = routes.iter().all(|route| !route.options.override_defaults);
        }

        if apply_defaults && !self.config.default_limits.is_empty() {
            plan.push(PlanEntry::new(
                self.key(request, scope),
                &self.config.default_limits,
            ));
        }

        plan
    }

    /// The fallback's own limits, or the regular ones when none are set.
    fn fallback_plan(&self, request: &RequestInfo) -> Plan<'_> {
        if self.config.fallback_limits.is_empty() {
            return self.shared_plan(request);
        }
        let scope = request.scope_for(self.config.key_style);
        vec![PlanEntry::new(
            self.key(request, scope),
            &self.config.fallback_limits,
        )]
    }

    /// Clear every counter in the shared store and the fallback.
    pub async fn reset(&self) -> Result<()> {
        self.store.reset().await?;
        if let FailurePolicy::Fallback(fallback) = &self.policy {
            fallback.reset().await?;
        }
        info!("Rate limit storage has been reset and all limits cleared");
        Ok(())
    }

    /// Drop elapsed fallback counters; returns how many were removed.
    pub fn cleanup_fallback(&self) -> usize {
        match &self.policy {
            FailurePolicy::Fallback(fallback) => fallback.cleanup_expired(),
            _ => 0,
        }
    }
}

/// Run the whole plan against one store in a single atomic call.
///
/// Stops at the first rejection; otherwise reports the most restrictive
/// admitted decision. A failed call charges nothing.
async fn evaluate<S>(
    store: &S,
    plan: &[PlanEntry<'_>],
    cost: u64,
) -> std::result::Result<Admission, StoreError>
where
    S: CounterStore + ?Sized,
{
    let mut checks = Vec::new();
    let mut messages = Vec::new();
    for entry in plan {
        for rule in entry.rules {
            checks.push((&entry.key, *rule));
            messages.push(entry.error_message);
        }
    }

    Ok(match check_rules(store, &checks, cost).await? {
        Some((index, mut decision)) => {
            if !decision.allowed {
                decision.error_message = messages.get(index).copied().flatten().map(str::to_string);
            }
            Admission::Checked(decision)
        }
        None => Admission::Unlimited,
    })
}

fn record(admission: &Admission) {
    if let Admission::Checked(decision) = admission {
        counter!(
            "turnstile_checks_total",
            "source" => decision.source.as_str(),
            "allowed" => if decision.allowed { "true" } else { "false" }
        )
        .increment(1);
    }
}
