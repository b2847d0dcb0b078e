use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::ErrorCategory;
use crate::error::{Result, TransferError};

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    Exponential,
    ExponentialWithJitter,
    Linear,
}

/// Retry policy for a single logical service operation.
///
/// `max_retries` counts re-attempts, so an operation runs at most
/// `max_retries + 1` times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "RetryPolicy::default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "RetryPolicy::default_strategy")]
    pub strategy: BackoffStrategy,

    #[serde(default = "RetryPolicy::default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "RetryPolicy::default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Spread applied by `exponential_with_jitter`, as a fraction of the delay
    #[serde(default = "RetryPolicy::default_jitter_factor")]
    pub jitter_factor: f64,

    /// Categories worth another attempt
    #[serde(default = "RetryPolicy::default_retry_on")]
    pub retry_on: Vec<ErrorCategory>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: Self::default_max_retries(),
            strategy: Self::default_strategy(),
            initial_delay_ms: Self::default_initial_delay_ms(),
            max_delay_ms: Self::default_max_delay_ms(),
            jitter_factor: Self::default_jitter_factor(),
            retry_on: Self::default_retry_on(),
        }
    }
}

impl RetryPolicy {
    fn default_max_retries() -> u32 {
        3
    }

    fn default_strategy() -> BackoffStrategy {
        BackoffStrategy::ExponentialWithJitter
    }

    fn default_initial_delay_ms() -> u64 {
        1_000
    }

    fn default_max_delay_ms() -> u64 {
        30_000
    }

    fn default_jitter_factor() -> f64 {
        0.2
    }

    fn default_retry_on() -> Vec<ErrorCategory> {
        ErrorCategory::DEFAULT_RETRYABLE.to_vec()
    }

    /// Fail on the first error
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn new(strategy: BackoffStrategy, max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            strategy,
            initial_delay_ms: initial_delay.as_millis() as u64,
            ..Default::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay_ms = max_delay.as_millis() as u64;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(TransferError::config(
                "retry.initial_delay_ms must not exceed retry.max_delay_ms",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(TransferError::config(
                "retry.jitter_factor must be between 0 and 1",
            ));
        }
        Ok(())
    }

    pub fn is_retryable(&self, category: ErrorCategory) -> bool {
        self.retry_on.contains(&category)
    }

    /// Delay before re-attempt number `retry` (1 for the first retry), or
    /// `None` once the budget is spent.
    pub fn delay_for(&self, retry: u32) -> Option<Duration> {
        if retry == 0 || retry > self.max_retries {
            return None;
        }
        let initial = self.initial_delay_ms as f64;
        let base = match self.strategy {
            BackoffStrategy::Fixed => initial,
            BackoffStrategy::Linear => initial * retry as f64,
            BackoffStrategy::Exponential | BackoffStrategy::ExponentialWithJitter => {
                initial * 2f64.powi(retry.saturating_sub(1).min(62) as i32)
            }
        };
        let max = self.max_delay_ms as f64;
        let mut delay = base.min(max);
        if self.strategy == BackoffStrategy::ExponentialWithJitter && self.jitter_factor > 0.0 {
            let spread = delay * self.jitter_factor;
            delay = rand::thread_rng().gen_range(delay - spread..=delay + spread).min(max);
        }
        Some(Duration::from_millis(delay.max(0.0) as u64))
    }
}
