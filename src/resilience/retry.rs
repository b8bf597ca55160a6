//! Retry with exponential backoff and jitter.
//!
//! Every attempt's outcome is reported to the shared [`CircuitBreaker`], so
//! failure accounting happens in one place whichever caller runs the operation.
//! Cancellation is observed both while the operation is in flight and during
//! the backoff delay; a cancelled run is never retried and never counted.

use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::circuit::CircuitBreaker;
use crate::error::{classify, CorrelationId, ErrorRecord, TransportError};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
  /// Total attempts, including the first one
  pub max_attempts: u32,
  /// Delay before the first retry; doubles on each further retry
  pub base_delay: Duration,
  /// Random jitter as a fraction of the delay (0.15 = ±15%)
  pub jitter: f64,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay: Duration::from_millis(300),
      jitter: 0.15,
    }
  }
}

impl RetryPolicy {
  /// Single attempt, no delay. Used to make automated runs deterministic.
  pub fn deterministic() -> Self {
    Self {
      max_attempts: 1,
      base_delay: Duration::ZERO,
      jitter: 0.0,
    }
  }

  /// `base_delay * 2^attempt * jitter`, with `attempt` 0-indexed.
  pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
    let base_ms = self.base_delay.as_millis() as f64 * 2f64.powi(attempt.min(31) as i32);
    let factor = if self.jitter > 0.0 {
      rand::rng().random_range((1.0 - self.jitter)..=(1.0 + self.jitter))
    } else {
      1.0
    };
    Duration::from_millis((base_ms * factor).max(0.0) as u64)
  }
}

#[derive(Debug, Clone)]
pub struct RetryExecutor {
  policy: RetryPolicy,
  breaker: Arc<CircuitBreaker>,
}

impl RetryExecutor {
  pub fn new(policy: RetryPolicy, breaker: Arc<CircuitBreaker>) -> Self {
    Self { policy, breaker }
  }

  pub fn policy(&self) -> &RetryPolicy {
    &self.policy
  }

  /// Run `operation` until it succeeds, attempts run out, or `cancel` fires.
  ///
  /// Failures are classified under `correlation_id`; the last one is returned
  /// once attempts are exhausted.
  pub async fn run<T, F, Fut>(
    &self,
    correlation_id: &CorrelationId,
    cancel: &CancellationToken,
    mut operation: F,
  ) -> Result<T, ErrorRecord>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
  {
    let max_attempts = self.policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
      if cancel.is_cancelled() {
        return Err(ErrorRecord::aborted(correlation_id.clone()));
      }

      debug!(%correlation_id, attempt = attempt + 1, max_attempts, "attempting request");
      let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransportError::Aborted),
        result = operation() => result,
      };

      let raw = match result {
        Ok(value) => {
          self.breaker.record_success();
          return Ok(value);
        }
        Err(raw) => raw,
      };

      let record = classify(&raw, Some(correlation_id.clone()));
      if record.is_aborted() {
        debug!(%correlation_id, "request cancelled, not retrying");
        return Err(record);
      }

      self.breaker.record_failure();
      attempt += 1;
      if attempt >= max_attempts {
        warn!(%correlation_id, kind = %record.kind, attempts = attempt, "request failed, giving up");
        return Err(record);
      }

      let delay = self.policy.delay_for_attempt(attempt - 1);
      warn!(
        %correlation_id,
        kind = %record.kind,
        attempt,
        delay_ms = delay.as_millis() as u64,
        "request failed, retrying"
      );

      tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ErrorRecord::aborted(correlation_id.clone())),
        _ = tokio::time::sleep(delay) => {}
      }
    }
  }
}
