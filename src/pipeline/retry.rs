//! Bounded retry with exponential backoff and a per-call timeout.
//!
//! Every external collaborator call goes through [`call_with_retry`]. Each
//! attempt runs under `tokio::time::timeout`; an attempt that overruns is
//! dropped (cancelling the in-flight future) and counted as a transient
//! failure. Validation errors end the loop at once.
//!
//! Backoff doubles per retry: with the default 500 ms base and 3 attempts
//! the waits are 500 ms then 1 s.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::region::Stage;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_ms: config.retry_backoff_ms,
            timeout: config.stage_timeout(),
        }
    }

    /// Delay before attempt `attempt` (1-indexed). Zero for the first.
    pub fn backoff_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 2u64.saturating_pow(attempt - 2);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

/// The error that ended a retry loop, with the number of attempts made.
#[derive(Debug)]
pub struct RetryFailure {
    pub error: PipelineError,
    pub attempts: u32,
}

/// A local failure (store I/O, decoding) counts as one spent attempt.
impl From<PipelineError> for RetryFailure {
    fn from(error: PipelineError) -> Self {
        Self { error, attempts: 1 }
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// attempt budget is spent.
///
/// `on_retry(attempt, error)` fires after each failed attempt that will be
/// retried. On success returns the value and the attempt that produced it.
pub async fn call_with_retry<T, F, Fut>(
    stage: Stage,
    policy: &RetryPolicy,
    mut on_retry: impl FnMut(u32, &PipelineError),
    mut op: F,
) -> Result<(T, u32), RetryFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PipelineError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let wait = policy.backoff_before(attempt);
        if !wait.is_zero() {
            sleep(wait).await;
        }

        let error = match timeout(policy.timeout, op()).await {
            Ok(Ok(value)) => return Ok((value, attempt)),
            Ok(Err(e)) => e,
            Err(_) => PipelineError::StageTimeout {
                stage,
                elapsed_ms: policy.timeout.as_millis() as u64,
            },
        };

        if !error.is_transient() || attempt >= policy.max_attempts {
            return Err(RetryFailure { error, attempts: attempt });
        }

        warn!(
            "Stage {}: attempt {}/{} failed, retrying in {:?}: {}",
            stage,
            attempt,
            policy.max_attempts,
            policy.backoff_before(attempt + 1),
            error
        );
        on_retry(attempt, &error);
    }
}
