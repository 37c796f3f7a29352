//! Turnstile - Request Admission Control
//!
//! This crate implements fixed-window rate limiting for HTTP services. Counters
//! live in a shared store (Redis) so every instance enforces the same quota; when
//! that store is unreachable the limiter degrades to an in-memory fallback and
//! pings the store until it comes back.

pub mod config;
pub mod error;
pub mod middleware;
pub mod ratelimit;
pub mod server;
