//! The product store: one handle owning the entity table, cache spaces,
//! circuit breaker and retry executor.
//!
//! A [`ProductStore`] is constructed once and cloned into whatever task needs
//! it; clones share state. Tests build fresh, isolated instances.

mod coordinator;
mod mutation;
mod state;

pub use mutation::BulkOutcome;
pub use state::{LastRequest, PendingMutation, RequestKind};

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

use crate::cache::{CacheKey, CacheManager, CachePolicy, CacheStats};
use crate::entity::Entity;
use crate::error::ErrorRecord;
use crate::resilience::{CircuitBreaker, CircuitPolicy, RetryExecutor, RetryPolicy};
use crate::snapshot::SnapshotStore;
use crate::transport::{Routes, Transport};
use state::StoreState;

/// Tunables for a store instance.
#[derive(Debug, Clone)]
pub struct StoreOptions {
  pub collection: String,
  pub id_field: String,
  pub cache: CachePolicy,
  pub circuit: CircuitPolicy,
  pub retry: RetryPolicy,
}

impl Default for StoreOptions {
  fn default() -> Self {
    Self {
      collection: "products".to_string(),
      id_field: "id".to_string(),
      cache: CachePolicy::default(),
      circuit: CircuitPolicy::default(),
      retry: RetryPolicy::default(),
    }
  }
}

struct Inner {
  transport: Arc<dyn Transport>,
  snapshot: Arc<dyn SnapshotStore>,
  routes: Routes,
  id_field: String,
  cache: CacheManager<Entity>,
  breaker: Arc<CircuitBreaker>,
  retry: RetryExecutor,
  state: Mutex<StoreState>,
  /// Cache keys with a background refresh in flight
  revalidating: Mutex<HashSet<CacheKey>>,
}

#[derive(Clone)]
pub struct ProductStore {
  inner: Arc<Inner>,
}

impl ProductStore {
  pub fn new(
    transport: Arc<dyn Transport>,
    snapshot: Arc<dyn SnapshotStore>,
    options: StoreOptions,
  ) -> Self {
    let breaker = Arc::new(CircuitBreaker::new(options.circuit));
    let retry = RetryExecutor::new(options.retry, breaker.clone());

    Self {
      inner: Arc::new(Inner {
        transport,
        snapshot,
        routes: Routes::new(&options.collection),
        id_field: options.id_field,
        cache: CacheManager::new(options.cache),
        breaker,
        retry,
        state: Mutex::new(StoreState::default()),
        revalidating: Mutex::new(HashSet::new()),
      }),
    }
  }

  fn state(&self) -> MutexGuard<'_, StoreState> {
    self
      .inner
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Populate the entity table from the offline snapshot. Call once at startup,
  /// before any fetch. Returns the number of entities restored.
  pub fn warm_start(&self) -> usize {
    let snapshot = match self.inner.snapshot.restore() {
      Ok(Some(snapshot)) => snapshot,
      Ok(None) => return 0,
      Err(e) => {
        warn!("failed to restore offline snapshot: {}", e);
        return 0;
      }
    };

    let mut state = self.state();
    if !state.table.is_empty() {
      return 0;
    }
    state.show(&snapshot.entities);
    info!(
      entities = snapshot.entities.len(),
      persisted_at = %snapshot.persisted_at,
      "restored offline snapshot"
    );
    snapshot.entities.len()
  }

  /// Cancel everything in flight and drop all in-memory state.
  pub fn reset(&self) {
    {
      let mut state = self.state();
      state.root.cancel();
      *state = StoreState::default();
    }
    self.inner.cache.clear();
    self.inner.breaker.reset();
    self
      .inner
      .revalidating
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clear();
    info!("store reset");
  }

  /// The visible result list.
  pub fn entities(&self) -> Vec<Entity> {
    self.state().visible_entities()
  }

  pub fn entity(&self, id: &str) -> Option<Entity> {
    self.state().table.get(id).cloned()
  }

  pub fn is_loading(&self) -> bool {
    self.state().is_loading()
  }

  pub fn last_error(&self) -> Option<ErrorRecord> {
    self.state().last_error.clone()
  }

  pub fn last_request(&self) -> Option<LastRequest> {
    self.state().last_request.clone()
  }

  pub fn pending_mutations(&self) -> usize {
    self.state().pending.len()
  }

  pub fn cache_stats(&self) -> CacheStats {
    self.inner.cache.stats()
  }

  pub fn cache_hit_ratio(&self) -> f64 {
    self.cache_stats().hit_ratio()
  }

  pub fn circuit_open(&self) -> bool {
    self.inner.breaker.is_open()
  }

  pub fn filters(&self) -> BTreeMap<String, String> {
    self.state().filters.clone()
  }

  /// Set the active filters. While any filter is set the page cache is bypassed.
  pub fn set_filters(&self, filters: BTreeMap<String, String>) {
    self.state().filters = filters;
  }
}
