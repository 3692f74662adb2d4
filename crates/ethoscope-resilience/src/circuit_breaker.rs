//! Circuit breaker for external data sources
//!
//! Stops a collector from hammering a dependency that keeps failing. While the
//! circuit is open, calls are rejected immediately without touching the network;
//! after the recovery timeout exactly one trial call decides whether to close it.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - calls pass through
    Closed,
    /// Too many consecutive failures - reject calls immediately
    Open,
    /// Recovery timeout elapsed - one trial call is in flight
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// A call was rejected because the circuit is open
///
/// This is an expected outcome, not a fault. Callers must not retry it within
/// the same cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit '{circuit}' is open (retry in {retry_in:?})")]
pub struct CircuitOpen {
    pub circuit: String,
    /// Time left until a trial call will be admitted; zero while a trial is in flight
    pub retry_in: Duration,
}

/// Decides which errors count toward the failure threshold
///
/// Network errors, timeouts and non-2xx responses trip the breaker.
/// A malformed payload proves the dependency answered and must not.
pub trait TripsBreaker {
    fn trips_breaker(&self) -> bool;
}

/// Outcome of [`CircuitBreaker::call`]
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error(transparent)]
    Open(CircuitOpen),
    #[error(transparent)]
    Inner(E),
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Circuit breaker guarding a single dependency
///
/// # States
///
/// - **Closed**: calls allowed; each failure increments the consecutive count
/// - **Open**: reached `failure_threshold`; calls rejected until `recovery_timeout` passes
/// - **HalfOpen**: exactly one trial call; success closes, failure reopens
///
/// # Example
///
/// ```
/// use ethoscope_resilience::{CircuitBreaker, CircuitState};
///
/// let cb = CircuitBreaker::new("mainnet", 2, std::time::Duration::from_secs(60));
///
/// cb.try_acquire().unwrap().failure();
/// cb.try_acquire().unwrap().failure();
///
/// assert_eq!(cb.state(), CircuitState::Open);
/// assert!(cb.try_acquire().is_err());
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    ///
    /// # Arguments
    ///
    /// * `name` - Used in logs and rejection errors
    /// * `failure_threshold` - Consecutive failures before opening (at least 1)
    /// * `recovery_timeout` - Time the circuit stays open before a trial call
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state as last recorded
    ///
    /// An open circuit whose timeout has elapsed still reports `Open` until the
    /// next call attempt moves it to `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Current consecutive failure count (for monitoring)
    pub fn failure_count(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Time until a trial call will be admitted, zero unless open
    pub fn time_until_retry(&self) -> Duration {
        let inner = self.lock();
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened_at)) => self
                .recovery_timeout
                .saturating_sub(Instant::now().saturating_duration_since(opened_at)),
            _ => Duration::ZERO,
        }
    }

    /// Ask for permission to make one call
    ///
    /// The returned permit must be settled with [`CallPermit::success`],
    /// [`CallPermit::failure`] or [`CallPermit::release`]. A permit dropped
    /// unsettled (e.g. the call was cancelled by a timeout) counts as a failure.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, CircuitOpen> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(CallPermit::new(self, false)),
            CircuitState::HalfOpen => {
                debug!(circuit = %self.name, "trial call already in flight, rejecting");
                Err(self.rejection(Duration::ZERO))
            }
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| Instant::now().saturating_duration_since(at))
                    .unwrap_or(self.recovery_timeout);

                if elapsed >= self.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    info!(circuit = %self.name, "recovery timeout elapsed, admitting trial call");
                    Ok(CallPermit::new(self, true))
                } else {
                    let retry_in = self.recovery_timeout - elapsed;
                    debug!(circuit = %self.name, ?retry_in, "circuit open, rejecting call");
                    Err(self.rejection(retry_in))
                }
            }
        }
    }

    /// Run `f` behind the breaker
    ///
    /// Errors are classified with [`TripsBreaker`]; only tripping errors count
    /// toward the failure threshold.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: TripsBreaker,
    {
        let permit = self.try_acquire().map_err(BreakerError::Open)?;
        match f().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                if e.trips_breaker() {
                    permit.failure();
                } else {
                    permit.release();
                }
                Err(BreakerError::Inner(e))
            }
        }
    }

    fn rejection(&self, retry_in: Duration) -> CircuitOpen {
        CircuitOpen {
            circuit: self.name.clone(),
            retry_in,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.lock();
        if trial {
            info!(circuit = %self.name, "trial call succeeded, closing circuit");
            inner.state = CircuitState::Closed;
            inner.consecutive_failures = 0;
            inner.opened_at = None;
        } else if inner.state == CircuitState::Closed {
            inner.consecutive_failures = 0;
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        if trial {
            warn!(circuit = %self.name, "trial call failed, reopening circuit");
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        } else if inner.state == CircuitState::Closed
            && inner.consecutive_failures >= self.failure_threshold
        {
            warn!(
                circuit = %self.name,
                failures = inner.consecutive_failures,
                "failure threshold reached, opening circuit"
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    /// A trial call finished without a verdict; the dependency answered
    fn on_release(&self, trial: bool) {
        if trial {
            self.on_success(true);
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new("default", 5, Duration::from_secs(60))
    }
}

/// Permission to make one call through a [`CircuitBreaker`]
#[must_use = "a dropped permit counts as a failed call"]
#[derive(Debug)]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    /// True when this is the single HALF_OPEN trial call
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }

    /// Settle without counting a failure (e.g. malformed payload)
    pub fn release(mut self) {
        self.settled = true;
        self.breaker.on_release(self.trial);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_failure(self.trial);
        }
    }
}
