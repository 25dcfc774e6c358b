//! Exponential backoff with jitter for swap API calls
//!
//! The policy itself is immutable; each call to [`BackoffPolicy::retry`] keeps
//! its attempt counter on its own stack, so agents sharing one client never
//! share retry state.

use super::SwapError;
use crate::config::BackoffConfig;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base: Duration,
    max_delay: Duration,
    max_attempts: u32,
    jitter: bool,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max_delay: Duration, max_attempts: u32, jitter: bool) -> Self {
        Self {
            base,
            max_delay,
            max_attempts: max_attempts.max(1),
            jitter,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `retry` (1-based).
    ///
    /// Retry `n` draws from `[base * 2^(n-1), 1.5 * base * 2^(n-1))`, so
    /// consecutive delays strictly increase until they hit `max_delay`.
    /// A service-provided `Retry-After` acts as a floor.
    pub fn delay_for(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        let floor = self.base.saturating_mul(1u32 << exponent);
        let delay = if self.jitter && !floor.is_zero() {
            let spread: f64 = rand::thread_rng().gen_range(0.0..0.5);
            floor.saturating_add(floor.mul_f64(spread))
        } else {
            floor
        };
        let delay = match retry_after {
            Some(hint) => delay.max(hint),
            None => delay,
        };
        delay.min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails non-retryably, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn retry<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, SwapError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, SwapError>>,
    {
        let mut attempt = 1u32;
        loop {
            tracing::debug!(label, attempt, "Swap service call");
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(label, attempt, "Swap service call succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(e) if e.class().is_retryable() => {
                    if attempt >= self.max_attempts {
                        tracing::warn!(label, attempt, error = %e, "Swap service retries exhausted");
                        return Err(SwapError::RetriesExhausted {
                            attempts: attempt,
                            last: Box::new(e),
                        });
                    }
                    let retry_after = match &e {
                        SwapError::RateLimited { retry_after } => *retry_after,
                        _ => None,
                    };
                    let delay = self.delay_for(attempt, retry_after);
                    tracing::warn!(
                        label,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Swap service call failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl From<&BackoffConfig> for BackoffPolicy {
    fn from(config: &BackoffConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.max_attempts,
            config.jitter,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(jitter: bool) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(100),
            Duration::from_millis(1_000),
            5,
            jitter,
        )
    }

    #[test]
    fn test_delays_double_until_cap() {
        let policy = policy(false);
        let delays: Vec<u128> = (1..=6)
            .map(|retry| policy.delay_for(retry, None).as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn test_jittered_delays_strictly_increase_below_cap() {
        let policy = BackoffPolicy::new(
            Duration::from_millis(100),
            Duration::from_secs(60),
            8,
            true,
        );
        for _ in 0..200 {
            let delays: Vec<Duration> = (1..=6).map(|retry| policy.delay_for(retry, None)).collect();
            assert!(delays.windows(2).all(|pair| pair[0] < pair[1]), "{:?}", delays);
        }
    }

    #[test]
    fn test_retry_after_is_a_floor_but_capped() {
        let policy = policy(false);
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_millis(300))),
            Duration::from_millis(300)
        );
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(30))),
            Duration::from_millis(1_000)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_at_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), SwapError> = policy(true)
            .retry("quote", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SwapError::RateLimited { retry_after: None }) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(matches!(
            result,
            Err(SwapError::RetriesExhausted { attempts: 5, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), SwapError> = policy(true)
            .retry("quote", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SwapError::NoRoute("no market".to_string())) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(SwapError::NoRoute(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let result = policy(false)
            .retry("swap", |attempt| async move {
                if attempt < 3 {
                    Err(SwapError::Timeout)
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(tokio_test::assert_ok!(result), 3);
    }
}
