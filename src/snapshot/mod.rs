//! Offline snapshot of the last known-good listing.
//!
//! Best effort only: a snapshot warms the entity table after a cold start or
//! refills the visible list after a failed fetch. It never takes part in cache
//! TTL or circuit breaker accounting.

mod storage;

pub use storage::{NoopSnapshot, Snapshot, SnapshotStore, SqliteSnapshot};
