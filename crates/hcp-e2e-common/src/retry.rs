//! Bounded retries for one-shot API calls
//!
//! Used where a single call may fail transiently without the step failing:
//! optimistic-concurrency conflicts on update, flaky deletes during teardown.
//! Waiting for a condition to become true is the poller's job
//! (`kube_utils::poll_until`), not this module's.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// How often and how patiently a call is retried
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total calls allowed, the first one included (0 = unbounded)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Default delays with a bounded number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Short, tight retries for update conflicts, which resolve as soon as
    /// the next read sees the competing write.
    pub fn conflicts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            ..Default::default()
        }
    }

    /// Delays to sleep between consecutive attempts.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            next: self.initial_delay,
            max: self.max_delay,
            multiplier: self.backoff_multiplier,
        }
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

/// Exponentially growing delays, capped at the configured maximum.
///
/// The sequence itself is deterministic; [`Backoff::jittered`] spreads a
/// single delay over 0.5x..1.5x so concurrent scenarios don't retry in step.
#[derive(Clone, Debug)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    multiplier: f64,
}

impl Backoff {
    /// Scale `delay` by a random factor in 0.5..1.5
    pub fn jittered(delay: Duration) -> Duration {
        delay.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next.min(self.max);
        self.next = Duration::from_secs_f64(
            (current.as_secs_f64() * self.multiplier).min(self.max.as_secs_f64()),
        );
        Some(current)
    }
}

/// Run `operation` until it succeeds, retrying every failure.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff_if(config, operation_name, |_| true, operation).await
}

/// Run `operation` until it succeeds, retrying only failures accepted by
/// `should_retry`.
///
/// Any other error is returned immediately, as is the last error once
/// `max_attempts` is used up.
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut delays = config.backoff();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let e = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if !should_retry(&e) {
            return Err(e);
        }
        if config.exhausted(attempt) {
            error!(operation = %operation_name, attempt, error = %e, "Giving up after retries");
            return Err(e);
        }

        let delay = Backoff::jittered(delays.next().unwrap_or(config.max_delay));
        warn!(
            operation = %operation_name,
            attempt,
            error = %e,
            delay_ms = delay.as_millis() as u64,
            "Attempt failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
