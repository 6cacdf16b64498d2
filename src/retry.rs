use std::future::Future;
use std::time::Duration;

use rand::Rng as _;

/// Retry decision returned by the error classifier callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Retry,
    Abort,
}

/// Message fragments that mark a failure as transient. Matching is
/// case-insensitive substring search on the error's display text, so
/// server-provided messages classify the same way client errors do.
const NETWORK_ERROR_INDICATORS: &[&str] = &[
    "failed to fetch",
    "network",
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "connection changed",
];

/// Retry and timeout tuning for remote uploads.
///
/// Values come from the environment (or CLI flags) and are clamped to sane
/// ranges at construction via [`RetryConfig::clamped`]; a bad value
/// degrades to the nearest bound instead of failing startup.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Retries after the first attempt, so `max_retries + 1` tries total.
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Hard per-attempt ceiling for a single binary upload.
    pub timeout_ms: u64,
    /// When false, nothing is ever retried regardless of classification.
    pub retry_on_network_errors: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 8_000,
            timeout_ms: 60_000,
            retry_on_network_errors: true,
        }
    }
}

impl RetryConfig {
    /// Build a config from unvalidated inputs, clamping each field to its
    /// supported range.
    pub fn clamped(
        max_retries: u32,
        initial_delay_ms: u64,
        max_delay_ms: u64,
        timeout_ms: u64,
        retry_on_network_errors: bool,
    ) -> Self {
        let config = Self {
            max_retries: max_retries.min(10),
            initial_delay_ms: initial_delay_ms.clamp(100, 5_000),
            max_delay_ms: max_delay_ms.clamp(1_000, 30_000),
            timeout_ms: timeout_ms.clamp(5_000, 300_000),
            retry_on_network_errors,
        };
        if config.max_retries != max_retries
            || config.initial_delay_ms != initial_delay_ms
            || config.max_delay_ms != max_delay_ms
            || config.timeout_ms != timeout_ms
        {
            tracing::debug!(?config, "retry settings clamped to supported ranges");
        }
        config
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Compute the backoff delay before retrying after the given attempt
/// (1-indexed: attempt 1 is the first try).
///
/// Formula: `min(initial_delay_ms * 2^(attempt-1), max_delay_ms)`, widened
/// by a uniform factor in `[0.75, 1.25]` so concurrent callers hitting the
/// same outage don't wake in lockstep. Rounded to whole milliseconds.
pub fn compute_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let exp_delay = config
        .initial_delay_ms
        .saturating_mul(1u64.checked_shl(exponent).unwrap_or(u64::MAX));
    let capped = exp_delay.min(config.max_delay_ms);
    let factor = rand::thread_rng().gen_range(0.75..=1.25);
    Duration::from_millis((capped as f64 * factor).round() as u64)
}

/// Whether a failed operation is worth retrying.
///
/// Purely a transient-vs-permanent classification: the attempt ceiling is
/// the retry loop's business, not this function's, so different call sites
/// can apply different ceilings to the same classifier.
pub fn should_retry(config: &RetryConfig, error: &impl std::fmt::Display) -> bool {
    if !config.retry_on_network_errors {
        return false;
    }
    let message = error.to_string().to_lowercase();
    NETWORK_ERROR_INDICATORS
        .iter()
        .any(|needle| message.contains(needle))
}

/// Retry an async operation with exponential backoff and jitter.
///
/// - `config`: backoff tuning; `max_retries` bounds the loop
/// - `classifier`: inspects an error and returns `Retry` or `Abort`
/// - `operation`: the async closure to retry
///
/// Returns the first `Ok` result, or the error from the final attempt if
/// the classifier aborts or retries run out.
pub async fn retry_with_backoff<F, Fut, T, E, C>(
    config: &RetryConfig,
    classifier: C,
    operation: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryAction,
    E: std::fmt::Display,
{
    let total_attempts = config.max_retries + 1;

    for attempt in 1..=total_attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if classifier(&e) == RetryAction::Abort || attempt == total_attempts {
                    return Err(e);
                }
                let delay = compute_delay(attempt, config);
                tracing::warn!(
                    "Transient failure (attempt {}/{}), retrying in {}ms: {}",
                    attempt,
                    total_attempts,
                    delay.as_millis(),
                    e
                );
                tokio::time::sleep(delay).await;
            }
        }
    }

    unreachable!("final attempt returns from inside the loop")
}
