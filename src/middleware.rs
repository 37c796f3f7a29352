//! axum middleware running the limiter before request handlers.
//!
//! ```rust,ignore
//! let app = Router::new()
//!     .route("/events/{id}", get(get_event))
//!     .route_layer(middleware::from_fn_with_state(limiter.clone(), rate_limit));
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, MatchedPath, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{debug, error};

use crate::error::TurnstileError;
use crate::ratelimit::{Admission, Decision, RateLimitHeaders, RateLimiter, RequestInfo};

const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
const DEFAULT_CLIENT: &str = "127.0.0.1";

/// Response sent when a request exceeds its limit.
#[derive(Debug)]
pub struct RateLimitRejection {
    message: String,
    headers: Option<RateLimitHeaders>,
}

impl RateLimitRejection {
    /// The registered error message of the rejecting limit, or the rule.
    pub fn new(decision: &Decision, headers: Option<RateLimitHeaders>) -> Self {
        let message = match &decision.error_message {
            Some(message) => message.clone(),
            None => format!("Rate limit exceeded: {}", decision.rule),
        };
        Self { message, headers }
    }
}

impl IntoResponse for RateLimitRejection {
    fn into_response(self) -> Response {
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": self.message })),
        )
            .into_response();
        if let Some(headers) = self.headers {
            headers.apply(response.headers_mut());
        }
        response
    }
}

impl IntoResponse for TurnstileError {
    fn into_response(self) -> Response {
        let status = match self {
            TurnstileError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Rate limiting middleware for use with `axum::middleware::from_fn_with_state`.
///
/// Does nothing unless both `enabled` and `auto_check` are set; with
/// `auto_check` off, handlers call [`RateLimiter::check`] themselves.
pub async fn rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let config = limiter.config();
    if !config.enabled || !config.auto_check {
        return next.run(request).await;
    }

    let info = request_info(&request);
    match limiter.check(&info).await {
        Ok(Admission::Unlimited) => next.run(request).await,
        Ok(Admission::Checked(decision)) => {
            let headers = config
                .headers_enabled
                .then(|| RateLimitHeaders::from_decision(&decision, config.retry_after));

            if !decision.allowed {
                debug!(
                    client = %info.client,
                    path = %info.path,
                    rule = %decision.rule,
                    "Request rejected by rate limit"
                );
                return RateLimitRejection::new(&decision, headers).into_response();
            }

            let mut response = next.run(request).await;
            if let Some(headers) = headers {
                headers.apply(response.headers_mut());
            }
            response
        }
        Err(e) => {
            error!(error = %e, path = %info.path, "Rate limit check failed");
            e.into_response()
        }
    }
}

/// Describe `request` for the limiter.
pub fn request_info(request: &Request) -> RequestInfo {
    let connect_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let info = RequestInfo::new(
        request.uri().path(),
        client_address(request.headers(), connect_addr),
    )
    .with_method(request.method().as_str());

    match request.extensions().get::<MatchedPath>() {
        Some(matched) => info.with_endpoint(matched.as_str()),
        None => info,
    }
}

/// The client address: first `X-Forwarded-For` entry, then the peer address.
pub fn client_address(headers: &HeaderMap, connect_addr: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get(FORWARDED_FOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());

    match (forwarded, connect_addr) {
        (Some(forwarded), _) => forwarded.to_string(),
        (None, Some(addr)) => addr.ip().to_string(),
        (None, None) => DEFAULT_CLIENT.to_string(),
    }
}
