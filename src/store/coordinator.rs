//! Listing and search requests.
//!
//! Each request kind has at most one primary request in flight. Starting a new
//! one cancels the previous one, whose result is then discarded without
//! touching shared state or the circuit breaker.

use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::state::{LastRequest, RequestKind};
use super::ProductStore;
use crate::cache::{CacheKey, CacheResult, QueryKey};
use crate::entity::{parse_list, Entity};
use crate::error::{CorrelationId, ErrorRecord, StoreError};

type FetchResult = Result<CacheResult<Vec<Entity>>, StoreError>;

impl ProductStore {
  /// Load one page of the collection.
  pub async fn fetch_page(&self, page: u32, page_size: u32) -> FetchResult {
    self
      .fetch(LastRequest::Page { page, page_size }, true)
      .await
  }

  /// Search the collection with the active filters.
  pub async fn search(&self, term: &str, page_size: u32) -> FetchResult {
    let request = LastRequest::Search {
      term: term.to_string(),
      page_size,
    };
    self.fetch(request, true).await
  }

  /// Re-issue the last listing or search, bypassing the cache.
  /// Returns `None` when nothing has been fetched yet.
  pub async fn refresh(&self) -> Result<Option<CacheResult<Vec<Entity>>>, StoreError> {
    let last = self.state().last_request.clone();
    match last {
      Some(request) => self.fetch(request, false).await.map(Some),
      None => Ok(None),
    }
  }

  fn cache_key(request: &LastRequest, filters: &BTreeMap<String, String>) -> Option<CacheKey> {
    match request {
      // Page results are only cacheable without filters
      LastRequest::Page { page, .. } if filters.is_empty() => Some(CacheKey::Page(*page)),
      LastRequest::Page { .. } => None,
      LastRequest::Search { term, page_size } => Some(CacheKey::Query(QueryKey::new(
        term, *page_size, filters,
      ))),
    }
  }

  fn path_for(&self, request: &LastRequest, filters: &BTreeMap<String, String>) -> String {
    match request {
      LastRequest::Page { page, page_size } => self.inner.routes.page(*page, *page_size),
      LastRequest::Search { term, .. } => self.inner.routes.search(term, filters),
    }
  }

  async fn fetch(&self, request: LastRequest, use_cache: bool) -> FetchResult {
    let kind = request.kind();
    // Key and path must agree on the filters even if they change mid-flight
    let filters = {
      let mut state = self.state();
      state.last_request = Some(request.clone());
      state.filters.clone()
    };

    if self.inner.breaker.is_open() {
      debug!(?kind, "circuit open, skipping request");
      return Ok(CacheResult::circuit_open());
    }

    let key = Self::cache_key(&request, &filters);
    let path = self.path_for(&request, &filters);
    if use_cache {
      if let Some(key) = &key {
        if let Some(hit) = self.inner.cache.get(key) {
          let entities = {
            let mut state = self.state();
            // A cached answer is the newest request of its kind
            state.slot(kind).cancel();
            state.show(&hit.payload);
            state.last_error = None;
            state.visible_entities()
          };
          if hit.needs_revalidate {
            self.spawn_revalidate(path, key.clone());
          }
          return Ok(CacheResult::from_cache(entities, hit.needs_revalidate));
        }
      }
    }

    let (in_flight, started) = {
      let mut state = self.state();
      let root = state.root.clone();
      (state.slot(kind).begin(&root), state.write_epoch)
    };

    let correlation_id = CorrelationId::new();
    debug!(%correlation_id, ?kind, %path, "fetching");
    let result = self
      .fetch_remote(&path, &correlation_id, &in_flight.token)
      .await;

    let outcome = {
      let mut state = self.state();
      let current = state.slot(kind).finish(in_flight.generation);
      match result {
        _ if !current => Err(None),
        Err(record) if record.is_aborted() => Err(None),
        Ok(entities) => {
          state.show_from(&entities, started);
          state.last_error = None;
          let overtaken = entities
            .iter()
            .any(|e| state.written_since(&e.id, started));
          Ok((entities, overtaken, state.visible_entities()))
        }
        Err(record) => {
          state.clear_results();
          state.last_error = Some(record.clone());
          Err(Some(record))
        }
      }
    };

    match outcome {
      Ok((fetched, overtaken, visible)) => {
        // A write confirmed meanwhile makes this payload older than the table
        if overtaken {
          debug!(%correlation_id, ?kind, "response predates a confirmed write, not cached");
        } else {
          if let Some(key) = &key {
            self.inner.cache.put(key, fetched.clone());
          }
          if matches!(request, LastRequest::Page { .. }) {
            self.persist_snapshot(&fetched);
          }
        }
        Ok(CacheResult::from_network(visible, correlation_id))
      }
      Err(None) => {
        debug!(%correlation_id, ?kind, "request superseded, result dropped");
        Ok(CacheResult::superseded(correlation_id))
      }
      Err(Some(record)) => {
        warn!(%correlation_id, kind = %record.kind, "fetch failed: {}", record.message);
        self.restore_snapshot();
        Err(StoreError::Request(record))
      }
    }
  }

  async fn fetch_remote(
    &self,
    path: &str,
    correlation_id: &CorrelationId,
    cancel: &CancellationToken,
  ) -> Result<Vec<Entity>, ErrorRecord> {
    let transport = &self.inner.transport;
    let id_field = self.inner.id_field.as_str();
    self
      .inner
      .retry
      .run(correlation_id, cancel, || async move {
        let body = transport.get(path).await?;
        parse_list(body, id_field)
      })
      .await
  }

  /// Keep the last good non-empty listing for the next cold start.
  fn persist_snapshot(&self, entities: &[Entity]) {
    if entities.is_empty() {
      return;
    }
    if let Err(e) = self.inner.snapshot.persist(entities) {
      warn!("failed to persist offline snapshot: {}", e);
    }
  }

  /// Refill the visible list from the snapshot after a failed fetch.
  fn restore_snapshot(&self) {
    match self.inner.snapshot.restore() {
      Ok(Some(snapshot)) if !snapshot.entities.is_empty() => {
        let mut state = self.state();
        state.show(&snapshot.entities);
        debug!(
          entities = snapshot.entities.len(),
          "visible list restored from offline snapshot"
        );
      }
      Ok(_) => {}
      Err(e) => warn!("failed to restore offline snapshot: {}", e),
    }
  }

  /// Refresh a stale cache entry in the background; at most one per key.
  fn spawn_revalidate(&self, path: String, key: CacheKey) {
    {
      let mut revalidating = self
        .inner
        .revalidating
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
      if !revalidating.insert(key.clone()) {
        return;
      }
    }

    let store = self.clone();
    tokio::spawn(async move {
      store.revalidate(&path, &key).await;
      store
        .inner
        .revalidating
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .remove(&key);
    });
  }

  /// `path` is the request that produced the entry under `key`.
  async fn revalidate(&self, path: &str, key: &CacheKey) {
    if self.inner.breaker.is_open() {
      return;
    }

    let (token, started) = {
      let state = self.state();
      (state.root.child_token(), state.write_epoch)
    };
    let correlation_id = CorrelationId::new();
    debug!(%correlation_id, %path, "revalidating stale cache entry");

    match self.fetch_remote(path, &correlation_id, &token).await {
      Ok(entities) => {
        let overtaken = {
          let mut state = self.state();
          state.accept_from(&entities, started);
          entities
            .iter()
            .any(|e| state.written_since(&e.id, started))
        };
        if !overtaken {
          self.inner.cache.put(key, entities);
        }
      }
      Err(record) if record.is_aborted() => {}
      Err(record) => {
        debug!(%correlation_id, kind = %record.kind, "background refresh failed");
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::super::test_support::*;
  use crate::cache::CacheSource;
  use crate::error::{ErrorKind, TransportError};
  use crate::snapshot::{SnapshotStore, SqliteSnapshot};
  use crate::transport::mock::{MockTransport, Verb};
  use pretty_assertions::assert_eq;
  use serde_json::json;
  use std::collections::BTreeMap;
  use std::sync::Arc;
  use std::time::Duration;

  fn unavailable() -> Result<serde_json::Value, TransportError> {
    Err(TransportError::Status {
      status: 503,
      body: String::new(),
    })
  }

  #[tokio::test(start_paused = true)]
  async fn test_fetch_page_populates_table_and_cache() {
    let transport = Arc::new(MockTransport::new());
    transport.reply(Verb::Get, "products/1/10", Ok(records(&["a", "b"])));
    let store = store(transport.clone());

    let result = store.fetch_page(1, 10).await.unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(visible_ids(&store), vec!["a", "b"]);
    assert!(store.entity("a").is_some());

    let again = store.fetch_page(1, 10).await.unwrap();
    assert_eq!(again.source, CacheSource::CacheFresh);
    assert_eq!(transport.calls(), 1);
    assert_eq!(store.cache_stats().hits, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_circuit_opens_after_threshold_fetch_failures() {
    let transport = Arc::new(MockTransport::new());
    transport.reply(Verb::Get, "products/1/10", unavailable());
    let store = store(transport.clone());

    for _ in 0..4 {
      let err = store.fetch_page(1, 10).await.unwrap_err();
      assert_eq!(err.record().map(|r| r.kind), Some(ErrorKind::Internal));
    }
    assert_eq!(transport.calls(), 4);

    let result = store.fetch_page(1, 10).await.unwrap();
    assert!(result.is_circuit_open());
    assert!(result.data.is_empty());
    assert_eq!(transport.calls(), 4);
  }

  #[tokio::test(start_paused = true)]
  async fn test_newer_request_wins() {
    let transport = Arc::new(MockTransport::new());
    transport.reply_after(
      Verb::Get,
      "products/1/10",
      Duration::from_millis(500),
      Ok(records(&["old"])),
    );
    transport.reply_after(
      Verb::Get,
      "products/2/10",
      Duration::from_millis(100),
      Ok(records(&["new"])),
    );
    let store = store(transport.clone());

    let a = tokio::spawn({
      let store = store.clone();
      async move { store.fetch_page(1, 10).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let b = store.fetch_page(2, 10).await.unwrap();
    let a = a.await.unwrap().unwrap();

    assert_eq!(b.source, CacheSource::Network);
    assert!(a.is_superseded());
    assert_eq!(visible_ids(&store), vec!["new"]);
    assert!(store.entity("old").is_none());
    assert!(!store.circuit_open());
    assert!(!store.is_loading());
  }

  #[tokio::test(start_paused = true)]
  async fn test_newer_search_wins() {
    let transport = Arc::new(MockTransport::new());
    transport.reply_after(
      Verb::Get,
      "products/search?pen",
      Duration::from_millis(500),
      Ok(records(&["old"])),
    );
    transport.reply_after(
      Verb::Get,
      "products/search?ink",
      Duration::from_millis(100),
      Ok(records(&["new"])),
    );
    let store = store(transport.clone());

    let first = tokio::spawn({
      let store = store.clone();
      async move { store.search("pen", 10).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = store.search("ink", 10).await.unwrap();
    let first = first.await.unwrap().unwrap();

    assert_eq!(second.source, CacheSource::Network);
    assert!(first.is_superseded());
    assert_eq!(visible_ids(&store), vec!["new"]);
    assert!(store.entity("old").is_none());
    assert_eq!(store.cache_stats().query_entries, 1);
    assert!(!store.circuit_open());
    assert!(!store.is_loading());
  }

  #[tokio::test(start_paused = true)]
  async fn test_listing_and_search_do_not_cancel_each_other() {
    let transport = Arc::new(MockTransport::new());
    transport.reply_after(
      Verb::Get,
      "products/1/10",
      Duration::from_millis(200),
      Ok(records(&["a"])),
    );
    transport.reply(Verb::Get, "products/search?pen", Ok(records(&["p"])));
    let store = store(transport.clone());

    let listing = tokio::spawn({
      let store = store.clone();
      async move { store.fetch_page(1, 10).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    store.search("pen", 10).await.unwrap();

    let listing = listing.await.unwrap().unwrap();
    assert_eq!(listing.source, CacheSource::Network);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failure_clears_results_and_sets_error() {
    let transport = Arc::new(MockTransport::new());
    transport.reply(Verb::Get, "products/1/10", Ok(records(&["a"])));
    transport.reply(
      Verb::Get,
      "products/2/10",
      Err(TransportError::Status {
        status: 401,
        body: r#"{"message":"token expired"}"#.into(),
      }),
    );
    let store = store(transport.clone());

    store.fetch_page(1, 10).await.unwrap();
    store.fetch_page(2, 10).await.unwrap_err();

    assert!(store.entities().is_empty());
    assert!(store.entity("a").is_none());
    let error = store.last_error().unwrap();
    assert_eq!(error.kind, ErrorKind::Unauthorized);
    assert_eq!(error.message, "token expired");
  }

  #[tokio::test(start_paused = true)]
  async fn test_failure_restores_offline_snapshot() {
    let transport = Arc::new(MockTransport::new());
    transport.reply(Verb::Get, "products/1/10", Ok(records(&["a", "b"])));
    transport.reply(
      Verb::Get,
      "products/2/10",
      Err(TransportError::Connect("refused".into())),
    );
    let snapshot = Arc::new(SqliteSnapshot::in_memory().unwrap());
    let store = store_with(transport.clone(), snapshot.clone(), options(4));

    store.fetch_page(1, 10).await.unwrap();
    assert_eq!(snapshot.restore().unwrap().unwrap().entities.len(), 2);

    let err = store.fetch_page(2, 10).await.unwrap_err();
    assert_eq!(err.record().unwrap().kind, ErrorKind::Network);
    assert_eq!(visible_ids(&store), vec!["a", "b"]);
    assert!(store.last_error().is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn test_warm_start_before_network() {
    let snapshot = Arc::new(SqliteSnapshot::in_memory().unwrap());
    let entities = crate::entity::parse_list(records(&["x", "y"]), "id").unwrap();
    snapshot.persist(&entities).unwrap();

    let transport = Arc::new(MockTransport::new());
    let store = store_with(transport.clone(), snapshot, options(4));

    assert_eq!(store.warm_start(), 2);
    assert_eq!(visible_ids(&store), vec!["x", "y"]);
    assert_eq!(transport.calls(), 0);
    assert_eq!(store.cache_stats().lookups(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_search_uses_query_cache_keyed_by_filters() {
    let transport = Arc::new(MockTransport::new());
    transport.reply(Verb::Get, "products/search?pen", Ok(records(&["p1"])));
    transport.reply(
      Verb::Get,
      "products/search?pen&category=office",
      Ok(records(&["p2"])),
    );
    let store = store(transport.clone());

    store.search("pen", 10).await.unwrap();
    store.search(" pen ", 10).await.unwrap();
    assert_eq!(transport.calls(), 1);

    let mut filters = BTreeMap::new();
    filters.insert("category".to_string(), "office".to_string());
    store.set_filters(filters);
    let filtered = store.search("pen", 10).await.unwrap();
    assert_eq!(filtered.source, CacheSource::Network);
    assert_eq!(transport.calls(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_filters_bypass_page_cache() {
    let transport = Arc::new(MockTransport::new());
    transport.reply(
      Verb::Get,
      "products/1/10",
      Ok(json!([
        {"id": "a", "category": "office"},
        {"id": "b", "category": "garden"}
      ])),
    );
    let store = store(transport.clone());
    let mut filters = BTreeMap::new();
    filters.insert("category".to_string(), "office".to_string());
    store.set_filters(filters);

    store.fetch_page(1, 10).await.unwrap();
    store.fetch_page(1, 10).await.unwrap();

    assert_eq!(transport.calls(), 2);
    assert_eq!(store.cache_stats().page_entries, 0);
    assert_eq!(visible_ids(&store), vec!["a"]);
    assert!(store.entity("b").is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_hit_is_served_and_revalidated() {
    let transport = Arc::new(MockTransport::new());
    transport.reply(Verb::Get, "products/1/10", Ok(records(&["a"])));
    transport.reply(Verb::Get, "products/1/10", Ok(records(&["a", "b"])));
    let store = store(transport.clone());

    store.fetch_page(1, 10).await.unwrap();
    tokio::time::advance(Duration::from_millis(61_000)).await;

    let stale = store.fetch_page(1, 10).await.unwrap();
    assert_eq!(stale.source, CacheSource::CacheStale);
    assert_eq!(stale.data.len(), 1);

    // Let the background refresh run
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(transport.calls(), 2);

    let fresh = store.fetch_page(1, 10).await.unwrap();
    assert_eq!(fresh.source, CacheSource::CacheFresh);
    assert_eq!(fresh.data.len(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_one_background_refresh_per_key() {
    let transport = Arc::new(MockTransport::new());
    transport.reply(Verb::Get, "products/1/10", Ok(records(&["a"])));
    transport.reply_after(
      Verb::Get,
      "products/1/10",
      Duration::from_millis(50),
      Ok(records(&["a", "b"])),
    );
    let store = store(transport.clone());

    store.fetch_page(1, 10).await.unwrap();
    tokio::time::advance(Duration::from_millis(61_000)).await;

    let first = store.fetch_page(1, 10).await.unwrap();
    let second = store.fetch_page(1, 10).await.unwrap();
    assert_eq!(first.source, CacheSource::CacheStale);
    assert_eq!(second.source, CacheSource::CacheStale);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.calls(), 2);

    // Both stale hits were answered by the single refresh
    let fresh = store.fetch_page(1, 10).await.unwrap();
    assert_eq!(fresh.source, CacheSource::CacheFresh);
    assert_eq!(fresh.data.len(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_revalidation_keeps_the_filters_of_its_entry() {
    let transport = Arc::new(MockTransport::new());
    transport.reply(Verb::Get, "products/search?pen", Ok(records(&["p1"])));
    transport.reply(
      Verb::Get,
      "products/search?pen",
      Ok(records(&["p1", "p2"])),
    );
    transport.reply(
      Verb::Get,
      "products/search?pen&category=garden",
      Ok(records(&["g1"])),
    );
    let store = store(transport.clone());

    store.search("pen", 10).await.unwrap();
    tokio::time::advance(Duration::from_millis(61_000)).await;
    let stale = store.search("pen", 10).await.unwrap();
    assert_eq!(stale.source, CacheSource::CacheStale);

    // Filters change before the background refresh runs
    let mut filters = BTreeMap::new();
    filters.insert("category".to_string(), "garden".to_string());
    store.set_filters(filters);
    tokio::time::sleep(Duration::from_millis(1)).await;
    store.set_filters(BTreeMap::new());

    let unfiltered = store.search("pen", 10).await.unwrap();
    assert_eq!(unfiltered.source, CacheSource::CacheFresh);
    let ids: Vec<_> = unfiltered.data.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["p1", "p2"]);
    assert_eq!(
      transport.calls_to(Verb::Get, "products/search?pen&category=garden"),
      0
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_refresh_bypasses_cache() {
    let transport = Arc::new(MockTransport::new());
    transport.reply(Verb::Get, "products/search?pen", Ok(records(&["p1"])));
    let store = store(transport.clone());

    assert!(store.refresh().await.unwrap().is_none());
    store.search("pen", 10).await.unwrap();
    let refreshed = store.refresh().await.unwrap().unwrap();

    assert_eq!(refreshed.source, CacheSource::Network);
    assert_eq!(transport.calls_to(Verb::Get, "products/search?pen"), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_reset_discards_in_flight_fetch() {
    let transport = Arc::new(MockTransport::new());
    transport.reply_after(
      Verb::Get,
      "products/1/10",
      Duration::from_millis(100),
      Ok(records(&["a"])),
    );
    let store = store(transport.clone());

    let pending = tokio::spawn({
      let store = store.clone();
      async move { store.fetch_page(1, 10).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(store.is_loading());
    store.reset();

    assert!(pending.await.unwrap().unwrap().is_superseded());
    assert!(store.entities().is_empty());
    assert!(!store.is_loading());
    assert!(store.last_request().is_none());
  }
}
