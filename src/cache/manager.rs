//! TTL cache manager with two size-bounded cache spaces.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::key::{CacheKey, CacheSpace};
use super::stats::CacheStats;
use super::traits::Cacheable;

/// TTL and capacity bounds for the cache spaces.
#[derive(Debug, Clone, Copy)]
pub struct CachePolicy {
  pub ttl: Duration,
  pub page_capacity: usize,
  pub query_capacity: usize,
}

impl Default for CachePolicy {
  fn default() -> Self {
    Self {
      ttl: Duration::from_millis(120_000),
      page_capacity: 20,
      query_capacity: 30,
    }
  }
}

/// A valid cache lookup.
#[derive(Debug, Clone)]
pub struct CacheHit<T> {
  pub payload: Vec<T>,
  pub age: Duration,
  /// Older than half the TTL; callers may refresh it out of band.
  pub needs_revalidate: bool,
}

#[derive(Debug)]
struct Entry<T> {
  stored_at: Instant,
  /// Insertion order, breaks ties between entries stored at the same instant.
  seq: u64,
  payload: Vec<T>,
}

#[derive(Debug)]
struct Space<K, T> {
  entries: HashMap<K, Entry<T>>,
  capacity: usize,
}

impl<K: Hash + Eq + Clone, T: Cacheable> Space<K, T> {
  fn new(capacity: usize) -> Self {
    Self {
      entries: HashMap::new(),
      capacity,
    }
  }

  /// Drop the oldest entries until the space fits its bound.
  fn evict_over_capacity(&mut self) -> usize {
    let excess = self.entries.len().saturating_sub(self.capacity);
    if excess == 0 {
      return 0;
    }

    let mut by_age: Vec<(Instant, u64, K)> = self
      .entries
      .iter()
      .map(|(k, e)| (e.stored_at, e.seq, k.clone()))
      .collect();
    by_age.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

    for (_, _, key) in by_age.into_iter().take(excess) {
      self.entries.remove(&key);
    }
    excess
  }

  fn remove_containing(&mut self, entity_key: &str) -> usize {
    let before = self.entries.len();
    self
      .entries
      .retain(|_, e| !e.payload.iter().any(|item| item.cache_key() == entity_key));
    before - self.entries.len()
  }
}

#[derive(Debug)]
struct Spaces<T> {
  page: Space<u32, T>,
  query: Space<String, T>,
  next_seq: u64,
}

/// Keyed storage for page and query results with expiry and bounded size.
///
/// An entry is valid while `now - stored_at < ttl`. Eviction removes the oldest
/// entries by insertion time, not by last access.
#[derive(Debug)]
pub struct CacheManager<T> {
  policy: CachePolicy,
  spaces: Mutex<Spaces<T>>,
  hits: AtomicU64,
  misses: AtomicU64,
}

impl<T: Cacheable> CacheManager<T> {
  pub fn new(policy: CachePolicy) -> Self {
    Self {
      policy,
      spaces: Mutex::new(Spaces {
        page: Space::new(policy.page_capacity),
        query: Space::new(policy.query_capacity),
        next_seq: 0,
      }),
      hits: AtomicU64::new(0),
      misses: AtomicU64::new(0),
    }
  }

  pub fn policy(&self) -> &CachePolicy {
    &self.policy
  }

  fn lock(&self) -> MutexGuard<'_, Spaces<T>> {
    self.spaces.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Look up a key. Expired entries are dropped and count as misses.
  pub fn get(&self, key: &CacheKey) -> Option<CacheHit<T>> {
    let now = Instant::now();
    let ttl = self.policy.ttl;
    let mut spaces = self.lock();

    let lookup = |entry: Option<&Entry<T>>| {
      entry.map(|e| (now.saturating_duration_since(e.stored_at), e.payload.clone()))
    };
    let found = match key {
      CacheKey::Page(page) => lookup(spaces.page.entries.get(page)),
      CacheKey::Query(query) => lookup(spaces.query.entries.get(&query.cache_hash())),
    };

    match found {
      Some((age, payload)) if age < ttl => {
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(CacheHit {
          payload,
          age,
          needs_revalidate: age > ttl / 2,
        })
      }
      Some(_) => {
        match key {
          CacheKey::Page(page) => {
            spaces.page.entries.remove(page);
          }
          CacheKey::Query(query) => {
            spaces.query.entries.remove(&query.cache_hash());
          }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
      }
      None => {
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
      }
    }
  }

  /// Store a payload, overwriting any previous entry, then enforce the bound.
  pub fn put(&self, key: &CacheKey, payload: Vec<T>) {
    {
      let mut spaces = self.lock();
      let seq = spaces.next_seq;
      spaces.next_seq += 1;
      let entry = Entry {
        stored_at: Instant::now(),
        seq,
        payload,
      };
      match key {
        CacheKey::Page(page) => {
          spaces.page.entries.insert(*page, entry);
        }
        CacheKey::Query(query) => {
          spaces.query.entries.insert(query.cache_hash(), entry);
        }
      }
    }
    self.evict_if_over_capacity(key.space());
  }

  /// Returns the number of evicted entries.
  pub fn evict_if_over_capacity(&self, space: CacheSpace) -> usize {
    let mut spaces = self.lock();
    let evicted = match space {
      CacheSpace::Page => spaces.page.evict_over_capacity(),
      CacheSpace::Query => spaces.query.evict_over_capacity(),
    };
    if evicted > 0 {
      debug!(%space, evicted, "evicted oldest cache entries");
    }
    evicted
  }

  /// Drop every entry, in both spaces, whose payload contains the entity.
  pub fn invalidate_entity(&self, entity_key: &str) -> usize {
    let mut spaces = self.lock();
    let removed =
      spaces.page.remove_containing(entity_key) + spaces.query.remove_containing(entity_key);
    if removed > 0 {
      debug!(entity_id = entity_key, removed, "invalidated cache entries");
    }
    removed
  }

  pub fn invalidate(&self, key: &CacheKey) {
    let mut spaces = self.lock();
    match key {
      CacheKey::Page(page) => {
        spaces.page.entries.remove(page);
      }
      CacheKey::Query(query) => {
        spaces.query.entries.remove(&query.cache_hash());
      }
    }
  }

  pub fn clear_space(&self, space: CacheSpace) {
    let mut spaces = self.lock();
    match space {
      CacheSpace::Page => spaces.page.entries.clear(),
      CacheSpace::Query => spaces.query.entries.clear(),
    }
  }

  /// Clear both spaces and the hit/miss counters.
  pub fn clear(&self) {
    let mut spaces = self.lock();
    spaces.page.entries.clear();
    spaces.query.entries.clear();
    self.hits.store(0, Ordering::Relaxed);
    self.misses.store(0, Ordering::Relaxed);
  }

  pub fn stats(&self) -> CacheStats {
    let spaces = self.lock();
    CacheStats {
      hits: self.hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
      page_entries: spaces.page.entries.len(),
      query_entries: spaces.query.entries.len(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::QueryKey;
  use crate::entity::Entity;
  use serde_json::json;
  use std::collections::BTreeMap;

  fn entity(id: &str) -> Entity {
    Entity::new(id, json!({ "id": id }))
  }

  fn ids(hit: &CacheHit<Entity>) -> Vec<&str> {
    hit.payload.iter().map(|e| e.id.as_str()).collect()
  }

  fn manager(ttl_ms: u64, capacity: usize) -> CacheManager<Entity> {
    CacheManager::new(CachePolicy {
      ttl: Duration::from_millis(ttl_ms),
      page_capacity: capacity,
      query_capacity: capacity,
    })
  }

  #[tokio::test(start_paused = true)]
  async fn test_ttl_hit_then_miss() {
    let cache = manager(1000, 20);
    cache.put(&CacheKey::Page(1), vec![entity("A"), entity("B")]);

    tokio::time::advance(Duration::from_millis(900)).await;
    let hit = cache.get(&CacheKey::Page(1)).expect("hit at 900ms");
    assert_eq!(ids(&hit), vec!["A", "B"]);

    tokio::time::advance(Duration::from_millis(101)).await;
    assert!(cache.get(&CacheKey::Page(1)).is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_exactly_ttl_is_a_miss() {
    let cache = manager(1000, 20);
    cache.put(&CacheKey::Page(1), vec![entity("A")]);
    tokio::time::advance(Duration::from_millis(1000)).await;
    assert!(cache.get(&CacheKey::Page(1)).is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_eviction_keeps_most_recent() {
    let cache = manager(60_000, 3);
    for page in 1..=5 {
      cache.put(&CacheKey::Page(page), vec![entity(&page.to_string())]);
      tokio::time::advance(Duration::from_millis(1)).await;
    }
    assert_eq!(cache.stats().page_entries, 3);
    assert!(cache.get(&CacheKey::Page(1)).is_none());
    assert!(cache.get(&CacheKey::Page(2)).is_none());
    for page in 3..=5 {
      assert!(cache.get(&CacheKey::Page(page)).is_some(), "page {}", page);
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_eviction_uses_insertion_order_on_ties() {
    let cache = manager(60_000, 2);
    for page in 1..=4 {
      cache.put(&CacheKey::Page(page), vec![entity("x")]);
    }
    assert!(cache.get(&CacheKey::Page(3)).is_some());
    assert!(cache.get(&CacheKey::Page(4)).is_some());
    assert!(cache.get(&CacheKey::Page(1)).is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_flag_after_half_ttl() {
    let cache = manager(1000, 20);
    cache.put(&CacheKey::Page(1), vec![entity("A")]);
    assert!(!cache.get(&CacheKey::Page(1)).unwrap().needs_revalidate);
    tokio::time::advance(Duration::from_millis(600)).await;
    assert!(cache.get(&CacheKey::Page(1)).unwrap().needs_revalidate);
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_entity_across_spaces() {
    let cache = manager(60_000, 20);
    let query = CacheKey::Query(QueryKey::new("pen", 10, &BTreeMap::new()));
    cache.put(&CacheKey::Page(1), vec![entity("A"), entity("B")]);
    cache.put(&CacheKey::Page(2), vec![entity("C")]);
    cache.put(&query, vec![entity("B")]);

    assert_eq!(cache.invalidate_entity("B"), 2);
    assert!(cache.get(&CacheKey::Page(1)).is_none());
    assert!(cache.get(&query).is_none());
    assert!(cache.get(&CacheKey::Page(2)).is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn test_hit_miss_counters() {
    let cache = manager(60_000, 20);
    assert!(cache.get(&CacheKey::Page(1)).is_none());
    cache.put(&CacheKey::Page(1), vec![entity("A")]);
    cache.get(&CacheKey::Page(1));
    cache.get(&CacheKey::Page(1));

    let stats = cache.stats();
    assert_eq!((stats.hits, stats.misses), (2, 1));
    assert!((stats.hit_ratio() - 2.0 / 3.0).abs() < 1e-9);
  }
}
