//! Sliding-window rate limiter
//!
//! Enforces "at most `max_calls` calls per rolling `period`". Timestamps older
//! than the period are pruned before every admission check.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tokio::time::{Duration, Instant};
use tracing::debug;

/// What `acquire` does when the window is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RatePolicy {
    /// Sleep until a slot frees up
    #[default]
    Wait,
    /// Deny the call outright
    Skip,
}

/// The call was denied under [`RatePolicy::Skip`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rate limit '{limiter}' exceeded (retry after {retry_after:?})")]
pub struct RateLimited {
    pub limiter: String,
    pub retry_after: Duration,
}

#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    max_calls: usize,
    period: Duration,
    policy: RatePolicy,
    window: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, max_calls: u32, period: Duration, policy: RatePolicy) -> Self {
        let max_calls = max_calls.max(1) as usize;
        Self {
            name: name.into(),
            max_calls,
            period,
            policy,
            window: Mutex::new(VecDeque::with_capacity(max_calls)),
        }
    }

    pub fn policy(&self) -> RatePolicy {
        self.policy
    }

    /// Synchronous admission check
    ///
    /// Records the call and returns `Ok` when admitted; otherwise returns the
    /// delay after which the oldest call leaves the window.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut window = self.lock();

        while let Some(&oldest) = window.front() {
            if now.saturating_duration_since(oldest) >= self.period {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() < self.max_calls {
            window.push_back(now);
            return Ok(());
        }

        let retry_after = window
            .front()
            .map(|&oldest| self.period.saturating_sub(now.saturating_duration_since(oldest)))
            .unwrap_or(Duration::ZERO);
        Err(retry_after)
    }

    /// Admit one call according to the configured policy
    pub async fn acquire(&self) -> Result<(), RateLimited> {
        loop {
            match self.try_acquire() {
                Ok(()) => return Ok(()),
                Err(retry_after) => match self.policy {
                    RatePolicy::Skip => {
                        debug!(limiter = %self.name, ?retry_after, "rate limited, skipping call");
                        return Err(RateLimited {
                            limiter: self.name.clone(),
                            retry_after,
                        });
                    }
                    RatePolicy::Wait => {
                        debug!(limiter = %self.name, ?retry_after, "rate limited, waiting");
                        tokio::time::sleep(retry_after).await;
                    }
                },
            }
        }
    }

    /// Calls currently inside the window
    pub fn in_window(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .iter()
            .filter(|&&at| now.saturating_duration_since(at) < self.period)
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Instant>> {
        self.window.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_admits_up_to_limit_then_reports_delay() {
        let limiter = RateLimiter::new("relay", 2, Duration::from_secs(12), RatePolicy::Skip);

        assert!(limiter.try_acquire().is_ok());
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(limiter.try_acquire().is_ok());

        assert_eq!(limiter.try_acquire(), Err(Duration::from_secs(8)));
        assert_eq!(limiter.in_window(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let limiter = RateLimiter::new("l2", 1, Duration::from_secs(1), RatePolicy::Skip);
        assert!(limiter.try_acquire().is_ok());
        assert!(limiter.try_acquire().is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_policy_denies() {
        let limiter = RateLimiter::new("relay", 1, Duration::from_secs(12), RatePolicy::Skip);
        limiter.acquire().await.unwrap();

        let denied = limiter.acquire().await.unwrap_err();
        assert_eq!(denied.retry_after, Duration::from_secs(12));
        assert_eq!(denied.limiter, "relay");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_policy_sleeps_until_admitted() {
        let limiter = RateLimiter::new("mainnet", 2, Duration::from_secs(10), RatePolicy::Wait);
        let start = Instant::now();

        limiter.acquire().await.unwrap();
        limiter.acquire().await.unwrap();
        limiter.acquire().await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[test]
    fn test_zero_calls_is_treated_as_one() {
        let limiter = RateLimiter::new("odd", 0, Duration::from_secs(1), RatePolicy::Skip);
        assert!(limiter.try_acquire().is_ok());
        assert!(limiter.try_acquire().is_err());
    }
}
