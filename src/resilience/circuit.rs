//! Consecutive-failure circuit breaker.
//!
//! Closing is observed rather than scheduled: once the cooldown deadline has
//! passed, the next call to [`CircuitBreaker::is_open`] performs the close
//! transition. Every gated operation polls `is_open` first, so no timer is needed.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct CircuitPolicy {
  /// Consecutive failures that open the circuit
  pub threshold: u32,
  /// How long the circuit stays open
  pub cooldown: Duration,
}

impl Default for CircuitPolicy {
  fn default() -> Self {
    Self {
      threshold: 4,
      cooldown: Duration::from_millis(30_000),
    }
  }
}

#[derive(Debug, Default)]
struct CircuitState {
  consecutive_failures: u32,
  open_until: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
  policy: CircuitPolicy,
  state: Mutex<CircuitState>,
}

impl CircuitBreaker {
  pub fn new(policy: CircuitPolicy) -> Self {
    Self {
      policy,
      state: Mutex::new(CircuitState::default()),
    }
  }

  fn lock(&self) -> MutexGuard<'_, CircuitState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Reset the failure count and close immediately.
  pub fn record_success(&self) {
    let mut state = self.lock();
    if state.open_until.take().is_some() {
      info!("circuit closed after successful call");
    }
    state.consecutive_failures = 0;
  }

  /// Count a failure; opens the circuit when the threshold is reached.
  pub fn record_failure(&self) {
    let mut state = self.lock();
    state.consecutive_failures = state.consecutive_failures.saturating_add(1);

    if state.open_until.is_none() && state.consecutive_failures >= self.policy.threshold {
      state.open_until = Some(Instant::now() + self.policy.cooldown);
      warn!(
        failures = state.consecutive_failures,
        cooldown_ms = self.policy.cooldown.as_millis() as u64,
        "circuit opened"
      );
    }
  }

  /// `true` while the cooldown has not elapsed. Observing an elapsed
  /// deadline closes the circuit and clears the failure count.
  pub fn is_open(&self) -> bool {
    let mut state = self.lock();
    match state.open_until {
      Some(deadline) if Instant::now() < deadline => true,
      Some(_) => {
        state.open_until = None;
        state.consecutive_failures = 0;
        info!("circuit cooldown elapsed, closed");
        false
      }
      None => false,
    }
  }

  pub fn consecutive_failures(&self) -> u32 {
    self.lock().consecutive_failures
  }

  /// Close and forget all failures.
  pub fn reset(&self) {
    *self.lock() = CircuitState::default();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
    CircuitBreaker::new(CircuitPolicy {
      threshold,
      cooldown: Duration::from_millis(cooldown_ms),
    })
  }

  #[tokio::test(start_paused = true)]
  async fn test_opens_at_threshold() {
    let cb = breaker(3, 1000);
    cb.record_failure();
    cb.record_failure();
    assert!(!cb.is_open());
    cb.record_failure();
    assert!(cb.is_open());
  }

  #[tokio::test(start_paused = true)]
  async fn test_success_resets_and_closes() {
    let cb = breaker(2, 1000);
    cb.record_failure();
    cb.record_success();
    cb.record_failure();
    assert!(!cb.is_open());

    cb.record_failure();
    assert!(cb.is_open());
    cb.record_success();
    assert!(!cb.is_open());
    assert_eq!(cb.consecutive_failures(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_cooldown_expiry_needs_fresh_threshold() {
    let cb = breaker(3, 1000);
    for _ in 0..3 {
      cb.record_failure();
    }
    tokio::time::advance(Duration::from_millis(999)).await;
    assert!(cb.is_open());

    tokio::time::advance(Duration::from_millis(1)).await;
    assert!(!cb.is_open());
    assert_eq!(cb.consecutive_failures(), 0);

    cb.record_failure();
    cb.record_failure();
    assert!(!cb.is_open());
    cb.record_failure();
    assert!(cb.is_open());
  }
}
