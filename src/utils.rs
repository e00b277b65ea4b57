// ABOUTME: Retry policy with capped exponential backoff and jitter
// ABOUTME: Used by the diff fetcher to absorb transient network failures

use rand::Rng;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;

/// Backoff settings for retrying transient failures.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt (0 = no retries)
    pub max_retries: u32,
    /// Delay before the first retry
    #[serde(with = "duration_secs")]
    pub initial_backoff: Duration,
    /// Upper bound for any single delay
    #[serde(with = "duration_secs")]
    pub max_backoff: Duration,
    /// Growth factor applied after each retry
    pub multiplier: f64,
    /// Relative jitter applied to each delay (0.3 = ±30%)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.3,
        }
    }
}

impl RetryPolicy {
    /// Policy without delays, for tests and callers that handle pacing themselves.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// Un-jittered delay before retry number `retry` (0-based), capped at `max_backoff`.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry as i32);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay before retry number `retry` with jitter applied.
    pub fn delay(&self, retry: u32) -> Duration {
        apply_jitter(self.base_delay(retry), self.jitter)
    }
}

fn apply_jitter(base: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 || base.is_zero() {
        return base;
    }
    let jitter = jitter.min(1.0);
    let factor = 1.0 + rand::thread_rng().gen_range(-jitter..jitter);
    Duration::from_millis((base.as_millis() as f64 * factor) as u64)
}

/// Retry an async operation while `is_retryable` says the error is transient.
///
/// Non-retryable errors are returned immediately. After `max_retries` retries
/// the last error is returned.
///
/// # Examples
///
/// ```no_run
/// # use osm_minutely::utils::{retry_with_backoff, RetryPolicy};
/// # async fn example() -> Result<(), String> {
/// let value = retry_with_backoff(
///     &RetryPolicy::default(),
///     || async { Ok::<_, String>("payload") },
///     |_err| true,
/// )
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut retry = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !is_retryable(&e) || retry >= policy.max_retries {
                    return Err(e);
                }

                let delay = policy.delay(retry);
                tracing::warn!(
                    "Operation failed (attempt {}/{}): {}. Retrying in {:?}...",
                    retry + 1,
                    policy.max_retries + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                retry += 1;
            }
        }
    }
}

/// Serde helper for durations expressed as (fractional) seconds in TOML.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom(format!(
                "duration must be a non-negative number of seconds, got {}",
                secs
            )));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}
