//! Retry executor for fallible async operations.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use crate::backoff::calculate_delay;

/// Options for [`retry`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOptions {
    /// Retries after the first attempt. `0` means a single attempt.
    pub retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Multiplier applied per retry.
    pub backoff_factor: f64,
    /// Randomize each delay by up to ±30%.
    pub jitter: bool,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            retries: 3,
            initial_delay: Duration::from_millis(1000),
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryOptions {
    /// Options with the given retry budget and the default delays.
    pub fn with_retries(retries: u32) -> Self {
        Self {
            retries,
            ..Default::default()
        }
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

/// Call `f` until it succeeds or the retry budget is spent.
///
/// Attempts run sequentially; between them the executor sleeps for the
/// delay computed from the number of retries made so far. Once `retries`
/// retries have failed, the last error is returned unchanged.
pub async fn retry<T, E, F, Fut>(mut f: F, options: RetryOptions) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt: u32 = 0;

    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= options.retries => {
                tracing::debug!(attempts = attempt + 1, error = %err, "Retry budget exhausted");
                return Err(err);
            }
            Err(err) => {
                let delay = calculate_delay(
                    attempt,
                    options.initial_delay,
                    options.backoff_factor,
                    options.jitter,
                );
                tracing::warn!(
                    attempt = attempt + 1,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn counting_failure(
        calls: Arc<AtomicU32>,
    ) -> impl FnMut() -> std::future::Ready<Result<(), String>> {
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(Err(format!("failure {n}")))
        }
    }

    #[test]
    fn test_retry_options_default() {
        let options = RetryOptions::default();
        assert_eq!(options.retries, 3);
        assert_eq!(options.initial_delay, Duration::from_millis(1000));
        assert_eq!(options.backoff_factor, 2.0);
        assert!(options.jitter);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_returns_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let start = Instant::now();

        let result: Result<u32, String> = retry(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(42) }
            },
            RetryOptions::default(),
        )
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_calls_once_without_delay() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let result = retry(counting_failure(calls.clone()), RetryOptions::with_retries(0)).await;

        assert_eq!(result, Err("failure 1".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_calls_retries_plus_one() {
        let calls = Arc::new(AtomicU32::new(0));

        let result = retry(counting_failure(calls.clone()), RetryOptions::with_retries(3)).await;

        assert_eq!(result, Err("failure 4".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delays_follow_exponential_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let options = RetryOptions::with_retries(3).jitter(false);
        let _ = retry(counting_failure(calls.clone()), options).await;

        // 1s + 2s + 4s
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(7));
        assert!(elapsed < Duration::from_millis(7010));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<&str, String> = retry(
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(format!("flaky {n}"))
                    } else {
                        Ok("done")
                    }
                }
            },
            RetryOptions::with_retries(5).initial_delay(Duration::from_millis(10)),
        )
        .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
