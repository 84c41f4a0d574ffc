//! Bounded retries with exponential backoff and jitter.
use std::{future::Future, time::Duration};

use rand::Rng;
use tracing::warn;

#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one. Never less than one.
    pub max_attempts: u32,

    /// Delay before the second attempt.
    pub initial_delay: Duration,

    /// Upper bound for the delay between two attempts, before jitter.
    pub max_delay: Duration,

    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// The un-jittered delay after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

/// Runs `operation` until it succeeds, fails with an error `is_retryable` rejects, or
/// `config.max_attempts` attempts were made.
///
/// Returns the last result together with the number of attempts made. Delays are jittered by a
/// factor between 0.5 and 1.5.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    is_retryable: P,
    mut operation: F,
) -> (Result<T, E>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error + 'static,
    P: Fn(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let error = match operation().await {
            Ok(value) => return (Ok(value), attempt),
            Err(error) => error,
        };

        if attempt >= max_attempts || !is_retryable(&error) {
            return (Err(error), attempt);
        }

        let jitter = rand::rng().random_range(0.5..1.5);
        let delay = config.delay_after(attempt).mul_f64(jitter);
        warn!(
            operation = operation_name,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis(),
            error = &error as &dyn std::error::Error,
            "operation failed, retrying"
        );

        tokio::time::sleep(delay).await;
    }
}
