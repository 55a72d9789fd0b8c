//! Backoff policy shared by stage attempts and checkpoint writes.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base * 2^retry`, capped.
    #[default]
    Exponential,
    /// Always `base`, capped.
    Constant,
}

/// Randomization applied to a computed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// Use the delay as computed.
    None,
    /// Uniform in `0..=delay`.
    #[default]
    Full,
}

/// Attempt budget and backoff for one kind of operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on any delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Growth of the delay.
    pub backoff_strategy: BackoffStrategy,
    /// Randomization of the delay.
    pub jitter_strategy: JitterStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::for_stages()
    }
}

impl RetryConfig {
    /// Same as [`RetryConfig::for_stages`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage processor attempts: 2 attempts, 500 ms base, 5 s cap.
    #[must_use]
    pub fn for_stages() -> Self {
        Self {
            max_attempts: 2,
            base_delay_ms: 500,
            max_delay_ms: 5_000,
            backoff_strategy: BackoffStrategy::Exponential,
            jitter_strategy: JitterStrategy::Full,
        }
    }

    /// Checkpoint writes: 3 attempts, 100 ms base, 2 s cap.
    #[must_use]
    pub fn for_checkpoints() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
            ..Self::for_stages()
        }
    }

    /// A single attempt.
    #[must_use]
    pub fn none() -> Self {
        Self::for_stages().with_max_attempts(1)
    }

    /// Sets the attempt budget. Zero is raised to one.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter_strategy = strategy;
        self
    }

    /// True if `attempts` tries leave room for another.
    #[must_use]
    pub fn allows_another(&self, attempts: u32) -> bool {
        attempts < self.max_attempts.max(1)
    }

    /// Delay before retry number `retry`, counted from zero.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let capped = match self.backoff_strategy {
            BackoffStrategy::Exponential => self
                .base_delay_ms
                .saturating_mul(2u64.saturating_pow(retry)),
            BackoffStrategy::Constant => self.base_delay_ms,
        }
        .min(self.max_delay_ms);

        let millis = match self.jitter_strategy {
            JitterStrategy::Full if capped > 0 => rand::thread_rng().gen_range(0..=capped),
            _ => capped,
        };
        Duration::from_millis(millis)
    }
}

/// Runs `operation` until it succeeds or the attempt budget is spent.
///
/// Returns the last error on exhaustion.
pub async fn with_retry<T, E, F, Fut>(config: &RetryConfig, key: &str, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    with_retry_if(config, key, operation, |_| true).await
}

/// Like [`with_retry`], but gives up at once on errors `retryable` rejects.
pub async fn with_retry_if<T, E, F, Fut, P>(
    config: &RetryConfig,
    key: &str,
    mut operation: F,
    retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !retryable(&err) || !config.allows_another(attempts) {
            return Err(err);
        }

        let delay = config.delay_for(attempts - 1);
        tracing::debug!(
            key,
            attempt = attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "Retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn exact(base: u64, max: u64) -> RetryConfig {
        RetryConfig::new()
            .with_base_delay_ms(base)
            .with_max_delay_ms(max)
            .with_jitter(JitterStrategy::None)
    }

    #[test]
    fn test_presets() {
        let stages = RetryConfig::for_stages();
        assert_eq!((stages.max_attempts, stages.base_delay_ms, stages.max_delay_ms), (2, 500, 5_000));

        let checkpoints = RetryConfig::for_checkpoints();
        assert_eq!(
            (checkpoints.max_attempts, checkpoints.base_delay_ms, checkpoints.max_delay_ms),
            (3, 100, 2_000)
        );

        assert!(!RetryConfig::none().allows_another(1));
        assert_eq!(RetryConfig::new().with_max_attempts(0).max_attempts, 1);
    }

    #[test]
    fn test_exponential_doubles_until_cap() {
        let config = exact(500, 5_000);
        let delays: Vec<u64> = (0..6)
            .map(|retry| u64::try_from(config.delay_for(retry).as_millis()).unwrap())
            .collect();

        assert_eq!(delays, vec![500, 1_000, 2_000, 4_000, 5_000, 5_000]);
        assert_eq!(config.delay_for(u32::MAX), Duration::from_millis(5_000));
    }

    #[test]
    fn test_constant_backoff() {
        let config = exact(100, 50).with_backoff(BackoffStrategy::Constant);
        assert_eq!(config.delay_for(7), Duration::from_millis(50));
    }

    #[test]
    fn test_full_jitter_stays_under_computed_delay() {
        let config = RetryConfig::for_checkpoints();
        for retry in 0..4 {
            let ceiling = exact(100, 2_000).delay_for(retry);
            assert!(config.delay_for(retry) <= ceiling);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_write_recovers_after_backoff() {
        let config = exact(100, 2_000).with_max_attempts(3);
        let outcomes = Mutex::new(vec![Ok("written"), Err("busy"), Err("busy")]);
        let started = tokio::time::Instant::now();

        let result = with_retry(&config, "competitors", || {
            let next = outcomes.lock().pop().unwrap_or(Err("drained"));
            async move { next }
        })
        .await;

        assert_eq!(result, Ok("written"));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(300) && waited < Duration::from_millis(310));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhausted_returns_last_error() {
        let config = exact(10, 10).with_max_attempts(3);
        let calls = Mutex::new(0u32);

        let result: Result<(), String> = with_retry(&config, "media", || {
            let n = {
                let mut calls = calls.lock();
                *calls += 1;
                *calls
            };
            async move { Err(format!("attempt {n}")) }
        })
        .await;

        assert_eq!(result, Err("attempt 3".to_string()));
        assert_eq!(*calls.lock(), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let config = exact(10, 10).with_max_attempts(5);
        let calls = Mutex::new(0u32);

        let result: Result<(), &str> = with_retry_if(
            &config,
            "synthesis",
            || {
                *calls.lock() += 1;
                async { Err("corrupt") }
            },
            |err| *err != "corrupt",
        )
        .await;

        assert_eq!(result, Err("corrupt"));
        assert_eq!(*calls.lock(), 1);
    }
}
