//! Bounded delivery of the pipeline's side effects
//!
//! Persisting a batch or publishing an event must never take the scheduling
//! loop down. [`deliver`] runs the effect under a [`RetryPolicy`] and hands
//! back a [`Delivery`] carrying either the value or the last error, so the
//! caller can keep failure streaks and escalate them.
//!
//! Not for configuration loading (a bad config stops startup) and not for
//! scoring itself (a failed computation skips the cycle).

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::{EthoscopeError, PipelineSettings, Result};

/// Base delay between persist attempts; attempt `n` waits `n` times this
pub const PERSIST_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, at least one
    pub attempts: usize,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// A single attempt (event publishing)
    pub const fn once() -> Self {
        Self {
            attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    /// Storage writes, as configured under `[pipeline]`
    pub fn persist(settings: &PipelineSettings) -> Self {
        Self {
            attempts: settings.persist_retries.max(1),
            backoff: PERSIST_BACKOFF,
        }
    }

    fn delay_after(&self, attempt: usize) -> Duration {
        self.backoff.saturating_mul(attempt as u32)
    }
}

/// What became of one side effect
#[derive(Debug)]
pub enum Delivery<T> {
    Delivered { value: T, attempts: usize },
    Failed { attempts: usize, error: EthoscopeError },
}

impl<T> Delivery<T> {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }

    pub fn attempts(&self) -> usize {
        match self {
            Self::Delivered { attempts, .. } | Self::Failed { attempts, .. } => *attempts,
        }
    }

    pub fn value(self) -> Option<T> {
        match self {
            Self::Delivered { value, .. } => Some(value),
            Self::Failed { .. } => None,
        }
    }
}

/// Run `effect` until it succeeds or the policy's attempts are spent
///
/// ```no_run
/// use ethoscope_core::delivery::{deliver, RetryPolicy};
/// use ethoscope_core::Result;
///
/// async fn append_gas_batch() -> Result<usize> {
///     Ok(12)
/// }
///
/// async fn example() {
///     let policy = RetryPolicy { attempts: 3, ..RetryPolicy::once() };
///     let delivery = deliver("persist gas", policy, append_gas_batch).await;
///     if !delivery.is_delivered() {
///         // count the failure towards the storage alert
///     }
/// }
/// ```
pub async fn deliver<F, Fut, T>(effect: &str, policy: RetryPolicy, mut run: F) -> Delivery<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;

    loop {
        match run().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(effect, attempt, "delivered after retry");
                }
                return Delivery::Delivered {
                    value,
                    attempts: attempt,
                };
            }
            Err(error) if attempt >= attempts => {
                warn!(effect, attempts = attempt, %error, "side effect dropped");
                return Delivery::Failed {
                    attempts: attempt,
                    error,
                };
            }
            Err(error) => {
                debug!(effect, attempt, of = attempts, %error, "attempt failed, retrying");
                tokio::time::sleep(policy.delay_after(attempt)).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EthoscopeConfig;
    use std::cell::Cell;

    #[tokio::test]
    async fn test_single_attempt_reports_error() {
        let delivery = deliver("publish", RetryPolicy::once(), || async {
            Err::<(), _>(EthoscopeError::Pipeline("no route".to_string()))
        })
        .await;

        match delivery {
            Delivery::Failed { attempts, error } => {
                assert_eq!(attempts, 1);
                assert!(matches!(error, EthoscopeError::Pipeline(_)));
            }
            Delivery::Delivered { .. } => panic!("expected a failed delivery"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_linear_backoff() {
        let calls = Cell::new(0);
        let started = tokio::time::Instant::now();
        let policy = RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(100),
        };

        let delivery = deliver("persist gas", policy, || {
            calls.set(calls.get() + 1);
            let ok = calls.get() == 3;
            async move {
                if ok {
                    Ok(7)
                } else {
                    Err(EthoscopeError::Storage("locked".to_string()))
                }
            }
        })
        .await;

        assert_eq!(delivery.attempts(), 3);
        assert_eq!(delivery.value(), Some(7));
        // 100ms after the first attempt, 200ms after the second
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_configured_attempts() {
        let calls = Cell::new(0);
        let mut settings = EthoscopeConfig::default().pipeline;
        settings.persist_retries = 2;

        let delivery = deliver("persist health_score", RetryPolicy::persist(&settings), || {
            calls.set(calls.get() + 1);
            async { Err::<(), _>(EthoscopeError::Storage("disk full".to_string())) }
        })
        .await;

        assert!(!delivery.is_delivered());
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_persist_policy_never_zero_attempts() {
        let mut settings = EthoscopeConfig::default().pipeline;
        settings.persist_retries = 0;
        assert_eq!(RetryPolicy::persist(&settings).attempts, 1);
    }
}
