//! Core traits and types for the caching system.

use crate::error::CorrelationId;

/// Trait for values that can be stored in a cache space.
///
/// The key lets the cache find and drop every entry that contains a given
/// entity once that entity changes on the server.
pub trait Cacheable: Clone + Send + Sync {
  /// Unique identifier for this value (e.g., entity id)
  fn cache_key(&self) -> &str;
}

/// Result of a listing or search, including where the data came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// Correlation id of the network request, if one was made
  pub correlation_id: Option<CorrelationId>,
}

impl<T> CacheResult<T> {
  /// Fresh data from the network.
  pub fn from_network(data: T, correlation_id: CorrelationId) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      correlation_id: Some(correlation_id),
    }
  }

  /// Data served from a cache space.
  pub fn from_cache(data: T, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      correlation_id: None,
    }
  }

  pub fn is_circuit_open(&self) -> bool {
    self.source == CacheSource::CircuitOpen
  }

  pub fn is_superseded(&self) -> bool {
    self.source == CacheSource::Superseded
  }
}

impl<T: Default> CacheResult<T> {
  /// Empty result returned without a network call while the breaker is open.
  pub fn circuit_open() -> Self {
    Self {
      data: T::default(),
      source: CacheSource::CircuitOpen,
      correlation_id: None,
    }
  }

  /// A newer request of the same kind started; this one's outcome was dropped.
  pub fn superseded(correlation_id: CorrelationId) -> Self {
    Self {
      data: T::default(),
      source: CacheSource::Superseded,
      correlation_id: Some(correlation_id),
    }
  }
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache, past half its TTL; a background refresh was requested
  CacheStale,
  /// Circuit breaker open, nothing fetched
  CircuitOpen,
  /// Cancelled by a newer request; shared state untouched
  Superseded,
}
