//! Rate limit key generation.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::rules::LimitRule;

/// Scope used for limits shared by every route of the application.
pub const GLOBAL_SCOPE: &str = "global";

/// Namespace every storage key lives under.
const STORAGE_NAMESPACE: &str = "LIMITER";

/// Selects what a request is bucketed by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStyle {
    /// The literal request path: `/events/123` and `/events/456` are separate.
    #[default]
    Url,
    /// The logical route: both paths above share the `/events/{id}` bucket.
    Endpoint,
}

/// What the embedding framework knows about one incoming request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    /// Literal request path
    pub path: String,
    /// Logical route identifier, when the router resolved one
    pub endpoint: Option<String>,
    /// Upper-case HTTP method
    pub method: String,
    /// Already-resolved client identity (usually the remote address)
    pub client: String,
}

impl RequestInfo {
    pub fn new(path: impl Into<String>, client: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            endpoint: None,
            method: "GET".to_string(),
            client: client.into(),
        }
    }

    pub fn with_method(mut self, method: &str) -> Self {
        self.method = method.to_ascii_uppercase();
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// The string requests are bucketed by under `style`.
    ///
    /// An endpoint-styled request the router could not resolve falls back to
    /// its path.
    pub fn scope_for(&self, style: KeyStyle) -> &str {
        match style {
            KeyStyle::Url => &self.path,
            KeyStyle::Endpoint => self.endpoint.as_deref().unwrap_or(&self.path),
        }
    }

    /// The route identifier used for route registration lookups.
    pub fn route(&self) -> &str {
        self.endpoint.as_deref().unwrap_or(&self.path)
    }
}

/// A key that identifies one rate limit bucket.
///
/// Built from the configured prefix, the client identity and a scope
/// (request path, route identifier, or a shared scope name).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// Configured key prefix, possibly empty
    pub prefix: String,
    /// Client identity
    pub identity: String,
    /// Bucket scope
    pub scope: String,
}

impl RateLimitKey {
    /// Create a new key.
    pub fn new(prefix: &str, identity: &str, scope: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            identity: identity.to_string(),
            scope: scope.to_string(),
        }
    }

    /// Convert the key to its string representation.
    pub fn to_string_key(&self) -> String {
        if self.prefix.is_empty() {
            format!("{}/{}", self.identity, self.scope)
        } else {
            format!("{}/{}/{}", self.prefix, self.identity, self.scope)
        }
    }

    /// The counter name a store keeps for this key under `rule`.
    pub fn storage_key(&self, rule: &LimitRule) -> String {
        format!(
            "{}/{}/{}",
            STORAGE_NAMESPACE,
            self.to_string_key(),
            rule.key_suffix()
        )
    }

    /// Namespace pattern matching every storage key.
    pub fn storage_pattern() -> String {
        format!("{}/*", STORAGE_NAMESPACE)
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}
