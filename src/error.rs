//! Error taxonomy for the store.
//!
//! Raw transport failures ([`TransportError`]) are classified into a closed set
//! of [`ErrorKind`]s, each carried by an [`ErrorRecord`] with a correlation id so
//! that every retry of one logical operation can be traced together.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Identifier attached to one logical operation across all of its attempts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
  pub fn new() -> Self {
    Self(uuid::Uuid::new_v4().to_string())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl Default for CorrelationId {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for CorrelationId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for CorrelationId {
  fn from(value: &str) -> Self {
    Self(value.to_string())
  }
}

/// Failure signal as reported by a transport, before classification.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
  #[error("cannot reach host: {0}")]
  Connect(String),
  #[error("name resolution failed: {0}")]
  Dns(String),
  #[error("request timed out")]
  Timeout,
  #[error("server responded with status {status}: {body}")]
  Status { status: u16, body: String },
  #[error("malformed response: {0}")]
  Decode(String),
  /// The request could not be built or completed for a reason other than
  /// connectivity (redirect loop, invalid request).
  #[error("request failed: {0}")]
  Request(String),
  #[error("request was cancelled")]
  Aborted,
}

impl TransportError {
  /// Connectivity-looking failures win over any status code that may be present.
  pub fn is_connectivity(&self) -> bool {
    matches!(self, Self::Connect(_) | Self::Dns(_) | Self::Timeout)
  }
}

/// Closed error taxonomy, plus the internal-only `Aborted` sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
  Network,
  Unauthorized,
  NotFound,
  Validation,
  RateLimit,
  Conflict,
  Internal,
  Unknown,
  /// Cancelled by a newer request or a reset. Never surfaced, never retried,
  /// never counted against the circuit breaker.
  Aborted,
}

impl ErrorKind {
  pub fn from_status(status: u16) -> Self {
    match status {
      400 | 422 => Self::Validation,
      401 | 403 => Self::Unauthorized,
      404 => Self::NotFound,
      409 => Self::Conflict,
      429 => Self::RateLimit,
      500..=599 => Self::Internal,
      _ => Self::Unknown,
    }
  }

  /// Stable message key for UI layers. `None` for `Aborted`.
  pub fn hint_key(self) -> Option<&'static str> {
    let key = match self {
      Self::Network => "errors.network",
      Self::Unauthorized => "errors.unauthorized",
      Self::NotFound => "errors.not_found",
      Self::Validation => "errors.validation",
      Self::RateLimit => "errors.rate_limit",
      Self::Conflict => "errors.conflict",
      Self::Internal => "errors.internal",
      Self::Unknown => "errors.unknown",
      Self::Aborted => return None,
    };
    Some(key)
  }

  pub fn is_aborted(self) -> bool {
    self == Self::Aborted
  }
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Network => "NETWORK",
      Self::Unauthorized => "UNAUTHORIZED",
      Self::NotFound => "NOT_FOUND",
      Self::Validation => "VALIDATION",
      Self::RateLimit => "RATE_LIMIT",
      Self::Conflict => "CONFLICT",
      Self::Internal => "INTERNAL",
      Self::Unknown => "UNKNOWN",
      Self::Aborted => "ABORTED",
    };
    f.write_str(name)
  }
}

/// A classified failure. Never persisted.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[error("{kind}: {message} (correlation {correlation_id})")]
pub struct ErrorRecord {
  pub kind: ErrorKind,
  pub message: String,
  pub correlation_id: CorrelationId,
}

impl ErrorRecord {
  pub fn new(kind: ErrorKind, message: impl Into<String>, correlation_id: CorrelationId) -> Self {
    Self {
      kind,
      message: message.into(),
      correlation_id,
    }
  }

  pub fn aborted(correlation_id: CorrelationId) -> Self {
    Self::new(ErrorKind::Aborted, "request was cancelled", correlation_id)
  }

  pub fn is_aborted(&self) -> bool {
    self.kind.is_aborted()
  }

  pub fn hint_key(&self) -> Option<&'static str> {
    self.kind.hint_key()
  }
}

/// Classify a raw transport failure, minting a correlation id if none is supplied.
pub fn classify(raw: &TransportError, correlation_id: Option<CorrelationId>) -> ErrorRecord {
  let correlation_id = correlation_id.unwrap_or_default();
  let kind = match raw {
    TransportError::Aborted => ErrorKind::Aborted,
    e if e.is_connectivity() => ErrorKind::Network,
    TransportError::Status { status, .. } => ErrorKind::from_status(*status),
    _ => ErrorKind::Unknown,
  };

  let message = match raw {
    TransportError::Status { body, .. } => server_message(body).unwrap_or_else(|| raw.to_string()),
    _ => raw.to_string(),
  };

  ErrorRecord::new(kind, message, correlation_id)
}

/// Backends reply with `{"message": "..."}` (sometimes `error`) on failure.
fn server_message(body: &str) -> Option<String> {
  let value: serde_json::Value = serde_json::from_str(body).ok()?;
  ["message", "error"]
    .iter()
    .find_map(|field| value.get(field).and_then(|v| v.as_str()))
    .map(String::from)
}

/// Failures surfaced by the store to its consumers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
  /// The circuit breaker is open; no call was attempted.
  #[error("backend unavailable, circuit open")]
  CircuitOpen,
  /// The entity is not in the entity table; no call was attempted.
  #[error("entity {0} is not loaded")]
  MissingEntity(String),
  /// Another write on this entity has not resolved yet.
  #[error("a save for entity {0} is already in progress")]
  MutationInFlight(String),
  /// A listing or search failed after retries.
  #[error("request failed: {0}")]
  Request(ErrorRecord),
  /// A write failed after retries and the optimistic change was reverted.
  #[error("save failed for entity {entity_id}, change reverted: {record}")]
  RolledBack {
    entity_id: String,
    record: ErrorRecord,
  },
  /// A write without an optimistic change (create) failed.
  #[error("save failed: {0}")]
  SaveFailed(ErrorRecord),
  /// The store was reset while the operation was in flight.
  #[error("operation cancelled")]
  Cancelled,
}

impl StoreError {
  /// The classified record behind this error, if a remote call was made.
  pub fn record(&self) -> Option<&ErrorRecord> {
    match self {
      Self::Request(record) | Self::SaveFailed(record) | Self::RolledBack { record, .. } => {
        Some(record)
      }
      _ => None,
    }
  }
}
