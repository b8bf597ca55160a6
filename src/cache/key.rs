//! Cache keys for the two cache spaces.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// The two independent cache spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheSpace {
  /// Listing results keyed by page number (no query or filter active)
  Page,
  /// Search results keyed by query text, page size and filters
  Query,
}

impl fmt::Display for CacheSpace {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Page => f.write_str("page"),
      Self::Query => f.write_str("query"),
    }
  }
}

/// A key in one of the cache spaces.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
  Page(u32),
  Query(QueryKey),
}

impl CacheKey {
  pub fn space(&self) -> CacheSpace {
    match self {
      Self::Page(_) => CacheSpace::Page,
      Self::Query(_) => CacheSpace::Query,
    }
  }
}

/// Search parameters that identify a query cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
  pub term: String,
  pub page_size: u32,
  pub filters: BTreeMap<String, String>,
}

impl QueryKey {
  pub fn new(term: &str, page_size: u32, filters: &BTreeMap<String, String>) -> Self {
    Self {
      term: term.to_string(),
      page_size,
      filters: filters.clone(),
    }
  }

  /// Canonical serialization: normalized term, page size, filters in key order.
  pub fn canonical(&self) -> String {
    let filters = self
      .filters
      .iter()
      .map(|(k, v)| format!("{}={}", k, v))
      .collect::<Vec<_>>()
      .join("&");
    format!(
      "search:{}:{}:{}",
      normalize_term(&self.term),
      self.page_size,
      filters
    )
  }

  /// SHA256 of the canonical form, for stable fixed-length keys.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.canonical().as_bytes());
    hex::encode(hasher.finalize())
  }

  pub fn description(&self) -> String {
    if self.filters.is_empty() {
      format!("search '{}' ({} per page)", self.term, self.page_size)
    } else {
      format!(
        "search '{}' ({} per page, {} filters)",
        self.term,
        self.page_size,
        self.filters.len()
      )
    }
  }
}

/// Trims surrounding whitespace, as the search route does. Case is kept: the
/// backend decides whether matching is case-sensitive.
fn normalize_term(term: &str) -> String {
  term.trim().to_string()
}
