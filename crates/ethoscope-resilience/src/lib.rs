//! # ethoscope-resilience
//!
//! Resilience primitives that keep a collector correct under partial failure.
//!
//! Nothing in here knows about metrics. Each primitive is owned by the
//! collector (or collector endpoint) it protects:
//!
//! - [`CircuitBreaker`] stops calling a dependency that keeps failing
//! - [`RateLimiter`] enforces "at most N calls per rolling period"
//! - [`TtlCache`] memoizes idempotent reads with single-flight semantics
//!
//! All timing goes through `tokio::time`, so tests can drive the clock.

mod cache;
mod circuit_breaker;
mod rate_limiter;

pub use cache::{cache_key, CacheStats, TtlCache};
pub use circuit_breaker::{
    BreakerError, CallPermit, CircuitBreaker, CircuitOpen, CircuitState, TripsBreaker,
};
pub use rate_limiter::{RateLimited, RateLimiter, RatePolicy};
