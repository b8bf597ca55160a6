use serde::Serialize;

/// Cache hit/miss counters and entry counts. Observability only.
#[derive(Debug, Clone, Copy, Serialize, Default, PartialEq)]
pub struct CacheStats {
  pub hits: u64,
  pub misses: u64,
  pub page_entries: usize,
  pub query_entries: usize,
}

impl CacheStats {
  pub fn lookups(&self) -> u64 {
    self.hits + self.misses
  }

  /// Fraction of lookups that hit. `0.0` before any lookup.
  pub fn hit_ratio(&self) -> f64 {
    let total = self.lookups();
    if total == 0 {
      return 0.0;
    }
    self.hits as f64 / total as f64
  }
}
