//! HTTP server hosting routes behind the rate limit middleware.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{middleware, routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::error::{Result, TurnstileError};
use crate::middleware::rate_limit;
use crate::ratelimit::RateLimiter;

/// How often elapsed fallback counters are dropped.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// HTTP server for a rate limited router.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The rate limiter instance
    rate_limiter: Arc<RateLimiter>,
    routes: Router,
    /// Prometheus recorder rendered on `/metrics`
    metrics: Option<PrometheusHandle>,
}

impl HttpServer {
    /// Create a server exposing only the `/ping` route.
    pub fn new(addr: SocketAddr, rate_limiter: Arc<RateLimiter>) -> Self {
        Self::with_routes(addr, rate_limiter, Router::new())
    }

    /// Create a server for `routes`; `/ping` is added alongside them.
    pub fn with_routes(addr: SocketAddr, rate_limiter: Arc<RateLimiter>, routes: Router) -> Self {
        Self {
            addr,
            rate_limiter,
            routes,
            metrics: None,
        }
    }

    /// Expose `handle` on `/metrics`, outside the rate limit.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// The router with the limiter middleware layered over every route.
    pub fn app(&self) -> Router {
        let app = self
            .routes
            .clone()
            .route("/ping", get(ping))
            .route_layer(middleware::from_fn_with_state(
                self.rate_limiter.clone(),
                rate_limit,
            ));

        match &self.metrics {
            Some(handle) => {
                let handle = handle.clone();
                app.route("/metrics", get(move || async move { handle.render() }))
            }
            None => app,
        }
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Starting HTTP server with graceful shutdown");

        let cleanup = tokio::spawn(cleanup_fallback(self.rate_limiter.clone()));
        let app = self.app();

        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TurnstileError::Server(e.to_string())
        });

        cleanup.abort();
        result
    }
}

async fn ping() -> &'static str {
    "PONG"
}

/// Periodically drop elapsed fallback counters.
async fn cleanup_fallback(rate_limiter: Arc<RateLimiter>) {
    let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        let removed = rate_limiter.cleanup_fallback();
        if removed > 0 {
            debug!(removed, "Cleaned up expired fallback counters");
        }
    }
}
