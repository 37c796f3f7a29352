//! Configuration management for Turnstile.
//!
//! Settings are read from a YAML file and overlaid with `TURNSTILE__*`
//! environment variables (for example `TURNSTILE__LIMITER__ENABLED=false`).
//! [`LimiterSettings::resolve`] validates everything once at startup and
//! produces the typed [`LimiterConfig`] the limiter runs on.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{parse_list, KeyStyle, LimitRule, RetryAfterStyle};

const ENV_PREFIX: &str = "TURNSTILE";
const LIST_SEPARATOR: &str = ";";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub limiter: LimiterSettings,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_addr")]
    pub addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
        }
    }
}

fn default_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8000))
}

/// Raw limiter settings as they appear in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Set to false to admit every request
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Whether `X-RateLimit-*` headers are written
    #[serde(default)]
    pub headers_enabled: bool,

    /// Check limits in middleware before any handler runs
    #[serde(default = "default_true")]
    pub auto_check: bool,

    /// Admit requests when the storage fails and no fallback is enabled
    #[serde(default)]
    pub swallow_errors: bool,

    /// Format of the `Retry-After` header
    #[serde(default)]
    pub retry_after: RetryAfterStyle,

    /// Limits applied to every route, counted per route
    #[serde(default)]
    pub default_limits: Vec<String>,

    /// Limits shared by all routes of the application
    #[serde(default)]
    pub application_limits: Vec<String>,

    /// In-memory fallback used while the storage is unreachable
    #[serde(default)]
    pub in_memory_fallback: InMemoryFallbackSettings,

    /// Prefix prepended to every rate limit key
    #[serde(default)]
    pub key_prefix: String,

    /// Whether requests are bucketed by literal path or by route
    #[serde(default)]
    pub key_style: KeyStyle,

    /// Storage location: `redis://…`, `rediss://…` or `memory://`
    #[serde(default = "default_storage_uri")]
    pub storage_uri: String,

    /// Upper bound on any single storage call, in milliseconds
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            headers_enabled: false,
            auto_check: true,
            swallow_errors: false,
            retry_after: RetryAfterStyle::default(),
            default_limits: Vec::new(),
            application_limits: Vec::new(),
            in_memory_fallback: InMemoryFallbackSettings::default(),
            key_prefix: String::new(),
            key_style: KeyStyle::default(),
            storage_uri: default_storage_uri(),
            store_timeout_ms: default_store_timeout(),
        }
    }
}

/// In-memory fallback settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InMemoryFallbackSettings {
    #[serde(default)]
    pub enabled: bool,

    /// Limits enforced while degraded. Empty means the regular limits apply.
    #[serde(default)]
    pub limits: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_storage_uri() -> String {
    "memory://".to_string()
}

fn default_store_timeout() -> u64 {
    250
}

/// Where the shared counters live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    /// A Redis-compatible server at the given URI
    Redis(String),
    /// Process-local counters
    Memory,
}

impl StorageBackend {
    fn parse(uri: &str) -> Result<Self> {
        let scheme = uri.split_once("://").map(|(scheme, _)| scheme);
        match scheme {
            Some("memory") => Ok(StorageBackend::Memory),
            Some("redis") | Some("rediss") | Some("redis+unix") | Some("unix") => {
                Ok(StorageBackend::Redis(uri.to_string()))
            }
            _ => Err(TurnstileError::Config(format!(
                "unsupported storage uri {:?}",
                uri
            ))),
        }
    }
}

/// What happens when the shared store cannot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Count against the in-memory fallback
    Fallback,
    /// Admit the request
    FailOpen,
    /// Report the failure to the caller
    FailClosed,
}

/// Validated limiter configuration. Built once, never re-parsed per request.
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    pub enabled: bool,
    pub headers_enabled: bool,
    pub auto_check: bool,
    pub retry_after: RetryAfterStyle,
    pub default_limits: Vec<LimitRule>,
    pub application_limits: Vec<LimitRule>,
    pub fallback_limits: Vec<LimitRule>,
    pub failure_mode: FailureMode,
    pub key_prefix: String,
    pub key_style: KeyStyle,
    pub storage: StorageBackend,
    pub store_timeout: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            headers_enabled: false,
            auto_check: true,
            retry_after: RetryAfterStyle::default(),
            default_limits: Vec::new(),
            application_limits: Vec::new(),
            fallback_limits: Vec::new(),
            failure_mode: FailureMode::FailClosed,
            key_prefix: String::new(),
            key_style: KeyStyle::default(),
            storage: StorageBackend::Memory,
            store_timeout: Duration::from_millis(default_store_timeout()),
        }
    }
}

impl LimiterSettings {
    /// Parse every rule string and the storage URI.
    pub fn resolve(&self) -> Result<LimiterConfig> {
        let fallback_enabled =
            self.in_memory_fallback.enabled || !self.in_memory_fallback.limits.is_empty();

        let failure_mode = if fallback_enabled {
            FailureMode::Fallback
        } else if self.swallow_errors {
            FailureMode::FailOpen
        } else {
            FailureMode::FailClosed
        };

        if self.store_timeout_ms == 0 {
            return Err(TurnstileError::Config(
                "store_timeout_ms must be positive".to_string(),
            ));
        }

        Ok(LimiterConfig {
            enabled: self.enabled,
            headers_enabled: self.headers_enabled,
            auto_check: self.auto_check,
            retry_after: self.retry_after,
            default_limits: parse_list(&self.default_limits)?,
            application_limits: parse_list(&self.application_limits)?,
            fallback_limits: parse_list(&self.in_memory_fallback.limits)?,
            failure_mode,
            key_prefix: self.key_prefix.clone(),
            key_style: self.key_style,
            storage: StorageBackend::parse(&self.storage_uri)?,
            store_timeout: Duration::from_millis(self.store_timeout_ms),
        })
    }
}

impl TurnstileConfig {
    /// Load configuration from an optional YAML file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, environment())
    }

    fn load_with(path: Option<&Path>, environment: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }

        builder
            .add_source(environment)
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| TurnstileError::Config(e.to_string()))
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| TurnstileError::Config(e.to_string()))
    }
}

/// `TURNSTILE__LIMITER__DEFAULT_LIMITS="10/second;500/day"` style overrides.
fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
        .list_separator(LIST_SEPARATOR)
        .with_list_parse_key("limiter.default_limits")
        .with_list_parse_key("limiter.application_limits")
        .with_list_parse_key("limiter.in_memory_fallback.limits")
}
