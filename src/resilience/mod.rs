//! Failure handling for remote calls: circuit breaker and retrying executor.

mod circuit;
mod retry;

pub use circuit::{CircuitBreaker, CircuitPolicy};
pub use retry::{RetryExecutor, RetryPolicy};
