//! Guarded calls: rate limiter, then cache, then circuit breaker, then the source

use ethoscope_core::{CollectorSettings, RateLimitPolicy};
use ethoscope_resilience::{
    BreakerError, CircuitBreaker, CircuitOpen, CircuitState, RateLimited, RateLimiter, RatePolicy,
    TtlCache,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::source::{Source, SourceFault, SourceRequest};

/// Outcome of a guarded call that produced no payload
#[derive(Debug, Clone, Error)]
pub enum CallError {
    #[error(transparent)]
    RateLimited(#[from] RateLimited),

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpen),

    #[error(transparent)]
    Source(#[from] SourceFault),
}

impl From<BreakerError<SourceFault>> for CallError {
    fn from(err: BreakerError<SourceFault>) -> Self {
        match err {
            BreakerError::Open(open) => CallError::CircuitOpen(open),
            BreakerError::Inner(fault) => CallError::Source(fault),
        }
    }
}

/// One external endpoint together with the primitives protecting it
///
/// Owned by exactly one collector; nothing here is shared across collectors.
pub struct GuardedSource {
    name: String,
    source: Arc<dyn Source>,
    limiter: RateLimiter,
    cache: TtlCache<Value>,
    breaker: CircuitBreaker,
}

impl GuardedSource {
    pub fn new(name: impl Into<String>, source: Arc<dyn Source>, settings: &CollectorSettings) -> Self {
        let name = name.into();
        let policy = match settings.rate_limit.policy {
            RateLimitPolicy::Wait => RatePolicy::Wait,
            RateLimitPolicy::Skip => RatePolicy::Skip,
        };

        Self {
            limiter: RateLimiter::new(
                name.clone(),
                settings.rate_limit.calls,
                Duration::from_secs(settings.rate_limit.period_secs),
                policy,
            ),
            cache: TtlCache::new(Duration::from_secs(settings.cache_ttl_secs)),
            breaker: CircuitBreaker::new(
                name.clone(),
                settings.failure_threshold,
                Duration::from_secs(settings.recovery_timeout_secs),
            ),
            name,
            source,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &str {
        self.source.endpoint()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Drop expired cached payloads, returning how many were removed
    pub fn purge_cache(&self) -> usize {
        self.cache.purge_expired()
    }

    /// Call the source without caching (reads that must be fresh)
    pub async fn call(&self, request: &SourceRequest) -> Result<Value, CallError> {
        self.limiter.acquire().await?;
        self.fetch_through_breaker(request).await
    }

    /// Call the source, reusing a live cached payload for idempotent reads
    pub async fn call_cached(&self, request: &SourceRequest) -> Result<Value, CallError> {
        self.limiter.acquire().await?;
        let key = request.cache_key(&self.name);
        self.cache
            .get_or_try_insert_with(&key, || self.fetch_through_breaker(request))
            .await
    }

    async fn fetch_through_breaker(&self, request: &SourceRequest) -> Result<Value, CallError> {
        self.breaker
            .call(|| self.source.fetch(request))
            .await
            .map_err(CallError::from)
    }
}

impl std::fmt::Debug for GuardedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedSource")
            .field("name", &self.name)
            .field("endpoint", &self.source.endpoint())
            .field("circuit", &self.breaker.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MockSource;
    use ethoscope_core::{CollectorKind, RateLimitSettings};
    use serde_json::json;

    fn settings() -> CollectorSettings {
        CollectorSettings {
            failure_threshold: 2,
            recovery_timeout_secs: 60,
            cache_ttl_secs: 30,
            rate_limit: RateLimitSettings {
                calls: 100,
                period_secs: 1,
                policy: RateLimitPolicy::Skip,
            },
            ..CollectorSettings::new(CollectorKind::Mainnet)
        }
    }

    fn gas_price() -> SourceRequest {
        SourceRequest::rpc("eth_gasPrice", json!([]))
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_call_hits_source_once() {
        let mock = MockSource::new("mock://mainnet").with_response("eth_gasPrice", json!("0x1"));
        let guarded = GuardedSource::new("mainnet", Arc::new(mock.clone()), &settings());

        guarded.call_cached(&gas_price()).await.unwrap();
        guarded.call_cached(&gas_price()).await.unwrap();
        assert_eq!(mock.call_count(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        guarded.call_cached(&gas_price()).await.unwrap();
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_cached_calls_single_flight() {
        let mock = MockSource::new("mock://mainnet")
            .with_response("eth_gasPrice", json!("0x1"))
            .with_delay(Duration::from_millis(300));
        let guarded = GuardedSource::new("mainnet", Arc::new(mock.clone()), &settings());

        let request = gas_price();
        let (a, b) = tokio::join!(guarded.call_cached(&request), guarded.call_cached(&request));
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_skips_network() {
        let mock = MockSource::new("mock://mainnet")
            .with_fault("eth_gasPrice", SourceFault::Status { status: 502, body: String::new() });
        let guarded = GuardedSource::new("mainnet", Arc::new(mock.clone()), &settings());

        for _ in 0..2 {
            assert!(matches!(guarded.call(&gas_price()).await, Err(CallError::Source(_))));
        }
        assert_eq!(guarded.circuit_state(), CircuitState::Open);

        assert!(matches!(
            guarded.call_cached(&gas_price()).await,
            Err(CallError::CircuitOpen(_))
        ));
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_skip_policy() {
        let mut tight = settings();
        tight.rate_limit = RateLimitSettings {
            calls: 1,
            period_secs: 12,
            policy: RateLimitPolicy::Skip,
        };
        let mock = MockSource::new("mock://relay").with_response("eth_gasPrice", json!("0x1"));
        let guarded = GuardedSource::new("relay", Arc::new(mock.clone()), &tight);

        guarded.call(&gas_price()).await.unwrap();
        assert!(matches!(
            guarded.call(&gas_price()).await,
            Err(CallError::RateLimited(_))
        ));
        assert_eq!(mock.call_count(), 1);
    }
}
