//! In-memory caching for listing and search results.
//!
//! This module provides:
//! - Two cache spaces: page results (keyed by page number) and query results
//!   (keyed by a canonical hash of term, page size and filters)
//! - Expiry after a process-wide TTL, with a stale-while-revalidate signal
//!   once an entry passes half its TTL
//! - Bounded size with oldest-inserted-first eviction
//! - Invalidation of every entry containing a changed entity

mod key;
mod manager;
mod stats;
mod traits;

pub use key::{CacheKey, CacheSpace, QueryKey};
pub use manager::{CacheHit, CacheManager, CachePolicy};
pub use stats::CacheStats;
pub use traits::{CacheResult, CacheSource, Cacheable};
