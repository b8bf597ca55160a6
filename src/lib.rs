//! Resilient data access for a REST collection.
//!
//! [`ProductStore`] sits between a UI and the backend: it classifies failures,
//! retries with backoff behind a circuit breaker, caches pages and searches
//! with a TTL, discards superseded requests, applies optimistic writes with
//! rollback and keeps an offline snapshot of the last good listing.

pub mod cache;
pub mod config;
pub mod entity;
pub mod error;
pub mod logging;
pub mod resilience;
pub mod snapshot;
pub mod store;
pub mod transport;

pub use cache::{CacheResult, CacheSource, CacheStats};
pub use entity::{Entity, Patch};
pub use error::{classify, CorrelationId, ErrorKind, ErrorRecord, StoreError, TransportError};
pub use snapshot::{NoopSnapshot, SnapshotStore, SqliteSnapshot};
pub use store::{BulkOutcome, ProductStore, StoreOptions};
pub use transport::{HttpTransport, Routes, Transport};
