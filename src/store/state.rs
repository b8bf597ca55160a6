//! Mutable state behind the store handle.
//!
//! Guarded by a single mutex that is never held across an await point, so
//! every write is a whole-entry replacement observed atomically by readers.

use std::collections::{BTreeMap, HashMap};
use tokio_util::sync::CancellationToken;

use crate::entity::{Entity, Patch};
use crate::error::{CorrelationId, ErrorRecord};

/// The two kinds of primary request; each has at most one in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
  Listing,
  Search,
}

/// What `refresh` re-issues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LastRequest {
  Page { page: u32, page_size: u32 },
  Search { term: String, page_size: u32 },
}

impl LastRequest {
  pub fn kind(&self) -> RequestKind {
    match self {
      Self::Page { .. } => RequestKind::Listing,
      Self::Search { .. } => RequestKind::Search,
    }
  }
}

/// A write applied optimistically and not yet confirmed by the server.
#[derive(Debug, Clone)]
pub struct PendingMutation {
  pub correlation_id: CorrelationId,
  pub entity_id: String,
  pub previous: Entity,
  pub patch: Patch,
}

#[derive(Debug, Clone)]
pub(crate) struct InFlight {
  pub generation: u64,
  pub token: CancellationToken,
}

/// Tracks the live primary request of one kind.
#[derive(Debug, Default)]
pub(crate) struct PrimarySlot {
  next_generation: u64,
  current: Option<InFlight>,
}

impl PrimarySlot {
  /// Cancel whatever is in flight and register a new request.
  pub fn begin(&mut self, parent: &CancellationToken) -> InFlight {
    self.cancel();
    self.next_generation += 1;
    let in_flight = InFlight {
      generation: self.next_generation,
      token: parent.child_token(),
    };
    self.current = Some(in_flight.clone());
    in_flight
  }

  pub fn cancel(&mut self) {
    if let Some(previous) = self.current.take() {
      previous.token.cancel();
    }
  }

  pub fn is_current(&self, generation: u64) -> bool {
    self
      .current
      .as_ref()
      .is_some_and(|c| c.generation == generation)
  }

  /// Clear the slot if `generation` still owns it.
  pub fn finish(&mut self, generation: u64) -> bool {
    if self.is_current(generation) {
      self.current = None;
      true
    } else {
      false
    }
  }

  pub fn in_flight(&self) -> bool {
    self.current.is_some()
  }
}

#[derive(Debug)]
pub(crate) struct StoreState {
  /// Entity id -> latest known value
  pub table: HashMap<String, Entity>,
  /// Ids of the current result list, in order
  pub visible: Vec<String>,
  pub last_error: Option<ErrorRecord>,
  pub last_request: Option<LastRequest>,
  pub filters: BTreeMap<String, String>,
  pub pending: HashMap<String, PendingMutation>,
  pub listing: PrimarySlot,
  pub search: PrimarySlot,
  /// Parent of every operation token; cancelled on reset
  pub root: CancellationToken,
  /// Bumped on every confirmed write
  pub write_epoch: u64,
  /// Entity id -> epoch of its last confirmed write
  pub confirmed_at: HashMap<String, u64>,
}

impl Default for StoreState {
  fn default() -> Self {
    Self {
      table: HashMap::new(),
      visible: Vec::new(),
      last_error: None,
      last_request: None,
      filters: BTreeMap::new(),
      pending: HashMap::new(),
      listing: PrimarySlot::default(),
      search: PrimarySlot::default(),
      root: CancellationToken::new(),
      write_epoch: 0,
      confirmed_at: HashMap::new(),
    }
  }
}

impl StoreState {
  pub fn slot(&mut self, kind: RequestKind) -> &mut PrimarySlot {
    match kind {
      RequestKind::Listing => &mut self.listing,
      RequestKind::Search => &mut self.search,
    }
  }

  pub fn is_loading(&self) -> bool {
    self.listing.in_flight() || self.search.in_flight()
  }

  /// Entities of the visible list, as currently held in the table.
  pub fn visible_entities(&self) -> Vec<Entity> {
    self
      .visible
      .iter()
      .filter_map(|id| self.table.get(id).cloned())
      .collect()
  }

  /// Record a server-confirmed value. Results of requests started before
  /// this point no longer override it.
  pub fn confirm_write(&mut self, entity: Entity) {
    self.write_epoch += 1;
    self
      .confirmed_at
      .insert(entity.id.clone(), self.write_epoch);
    self.table.insert(entity.id.clone(), entity);
  }

  /// Whether a write on `id` was confirmed after `epoch`.
  pub fn written_since(&self, id: &str, epoch: u64) -> bool {
    self.confirmed_at.get(id).is_some_and(|&at| at > epoch)
  }

  /// Accept server values, keeping optimistic values that are still pending.
  pub fn accept(&mut self, entities: &[Entity]) {
    self.accept_from(entities, self.write_epoch);
  }

  /// Like [`accept`](Self::accept) for a response to a request started at
  /// write epoch `started`: entities confirmed since then keep their value.
  pub fn accept_from(&mut self, entities: &[Entity], started: u64) {
    for entity in entities {
      if self.pending.contains_key(&entity.id) || self.written_since(&entity.id, started) {
        continue;
      }
      self.table.insert(entity.id.clone(), entity.clone());
    }
  }

  /// Replace the visible list, applying active filters.
  pub fn show(&mut self, entities: &[Entity]) {
    self.show_from(entities, self.write_epoch);
  }

  pub fn show_from(&mut self, entities: &[Entity], started: u64) {
    self.accept_from(entities, started);
    let filters = &self.filters;
    self.visible = entities
      .iter()
      .filter(|e| e.matches(filters))
      .map(|e| e.id.clone())
      .collect();
  }

  /// Forget results after a failed fetch. Entities with a pending write stay so
  /// that the write can still confirm or roll back against them.
  pub fn clear_results(&mut self) {
    let pending = &self.pending;
    self.table.retain(|id, _| pending.contains_key(id));
    self.visible.clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_begin_cancels_previous() {
    let root = CancellationToken::new();
    let mut slot = PrimarySlot::default();
    let first = slot.begin(&root);
    let second = slot.begin(&root);

    assert!(first.token.is_cancelled());
    assert!(!second.token.is_cancelled());
    assert!(!slot.is_current(first.generation));
    assert!(!slot.finish(first.generation));
    assert!(slot.finish(second.generation));
    assert!(!slot.in_flight());
  }

  #[test]
  fn test_show_applies_filters_and_keeps_pending() {
    let mut state = StoreState::default();
    let optimistic = Entity::new("1", json!({"id": "1", "kind": "pen", "price": 9}));
    state.table.insert("1".into(), optimistic.clone());
    state.pending.insert(
      "1".into(),
      PendingMutation {
        correlation_id: CorrelationId::new(),
        entity_id: "1".into(),
        previous: Entity::new("1", json!({"id": "1", "kind": "pen", "price": 5})),
        patch: Patch::new().set("price", 9),
      },
    );
    state.filters.insert("kind".into(), "pen".into());

    state.show(&[
      Entity::new("1", json!({"id": "1", "kind": "pen", "price": 5})),
      Entity::new("2", json!({"id": "2", "kind": "ink"})),
    ]);

    assert_eq!(state.visible, vec!["1".to_string()]);
    assert_eq!(state.table["1"], optimistic);
    assert!(state.table.contains_key("2"));
  }

  #[test]
  fn test_confirmed_write_outlives_older_response() {
    let mut state = StoreState::default();
    let started = state.write_epoch;
    let confirmed = Entity::new("1", json!({"id": "1", "name": "renamed"}));
    state.confirm_write(confirmed.clone());

    state.show_from(&[Entity::new("1", json!({"id": "1", "name": "old"}))], started);
    assert_eq!(state.table["1"], confirmed);
    assert_eq!(state.visible, vec!["1".to_string()]);

    // A response to a request started after the write wins again
    let newer = Entity::new("1", json!({"id": "1", "name": "newer"}));
    state.show_from(&[newer.clone()], state.write_epoch);
    assert_eq!(state.table["1"], newer);
  }
}
