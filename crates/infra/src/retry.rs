//! Bounded retry for transient engine failures.
//!
//! A lost compare-and-swap or a storage hiccup is worth retrying a few times;
//! business rejections never are. The guard counts consecutive failures per
//! session and gives up once the policy says so.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::engine::EngineError;

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// base * attempt
    Linear,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Consecutive failures tolerated before giving up.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Delay before the retry that follows failure number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 2_u32.saturating_pow(attempt - 1);
                self.base_delay.saturating_mul(factor)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
        };
        delay.min(self.max_delay)
    }

    pub fn should_retry(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Consecutive-failure counter for one client session.
#[derive(Debug, Clone)]
pub struct AllocationRetryGuard {
    policy: RetryPolicy,
    consecutive_failures: u32,
}

impl AllocationRetryGuard {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            consecutive_failures: 0,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Count a failure and decide whether another attempt is allowed.
    pub fn record_failure(&mut self, err: &EngineError) -> RetryDecision {
        self.consecutive_failures += 1;
        if !err.is_transient() || !self.policy.should_retry(self.consecutive_failures) {
            return RetryDecision::GiveUp;
        }
        RetryDecision::RetryAfter(self.policy.delay_for_attempt(self.consecutive_failures))
    }
}

/// Run `op` until it succeeds, fails permanently, or the policy is exhausted.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let mut guard = AllocationRetryGuard::new(policy.clone());
    loop {
        match op().await {
            Ok(value) => {
                guard.record_success();
                return Ok(value);
            }
            Err(err) => match guard.record_failure(&err) {
                RetryDecision::RetryAfter(delay) => {
                    debug!(operation, attempt = guard.consecutive_failures(), ?delay, error = %err, "retrying transient failure");
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp => {
                    if err.is_transient() {
                        warn!(operation, attempts = guard.consecutive_failures(), error = %err, "giving up after repeated transient failures");
                    }
                    return Err(err);
                }
            },
        }
    }
}
