//! Optimistic writes with rollback.
//!
//! A write is applied to the entity table immediately, then sent through the
//! retry executor. If the server rejects it the previous value is restored. A
//! second write to an entity whose first write has not resolved is rejected.

use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::state::PendingMutation;
use super::ProductStore;
use crate::entity::{parse_write_response, Entity, Patch};
use crate::error::{CorrelationId, StoreError};

/// Per-entity results of a bulk write, sharing one correlation id.
#[derive(Debug)]
pub struct BulkOutcome {
  pub correlation_id: CorrelationId,
  pub applied: Vec<Entity>,
  pub failed: Vec<(String, StoreError)>,
}

impl BulkOutcome {
  pub fn is_complete(&self) -> bool {
    self.failed.is_empty()
  }
}

#[derive(Debug, Clone, Copy)]
enum Write {
  /// `PUT {collection}/{id}` with the patch as body
  Update,
  /// `PUT {collection}/{id}/delete`
  SoftDelete,
}

impl ProductStore {
  /// Apply `patch` to one entity optimistically and persist it.
  pub async fn apply_patch(&self, entity_id: &str, patch: Patch) -> Result<Entity, StoreError> {
    self
      .mutate(entity_id, patch, CorrelationId::new(), Write::Update)
      .await
  }

  /// Apply the same patch to several entities. Each entity confirms or rolls
  /// back on its own.
  pub async fn bulk_apply(&self, entity_ids: &[String], patch: Patch) -> BulkOutcome {
    self.bulk(entity_ids, patch, Write::Update).await
  }

  /// Soft-delete one entity: it is flagged inactive, never removed.
  pub async fn deactivate(&self, entity_id: &str) -> Result<Entity, StoreError> {
    self
      .mutate(
        entity_id,
        Patch::deactivate(),
        CorrelationId::new(),
        Write::SoftDelete,
      )
      .await
  }

  pub async fn bulk_deactivate(&self, entity_ids: &[String]) -> BulkOutcome {
    self
      .bulk(entity_ids, Patch::deactivate(), Write::SoftDelete)
      .await
  }

  /// Create a new entity. Returns the stored entity, or `None` when the
  /// server only acknowledged the write.
  pub async fn create(&self, record: Value) -> Result<Option<Entity>, StoreError> {
    if self.inner.breaker.is_open() {
      return Err(StoreError::CircuitOpen);
    }

    let correlation_id = CorrelationId::new();
    let token = self.state().root.child_token();
    let path = self.inner.routes.create();
    let transport = &self.inner.transport;

    let result = self
      .inner
      .retry
      .run(&correlation_id, &token, || {
        let body = record.clone();
        let path = path.as_str();
        async move { transport.post(path, body).await }
      })
      .await;

    match result {
      Ok(response) => {
        let created = parse_write_response(response, &self.inner.id_field);
        if let Some(entity) = &created {
          self.state().confirm_write(entity.clone());
        }
        // Any cached listing may now be missing the new entity
        self.inner.cache.clear_space(crate::cache::CacheSpace::Page);
        self.inner.cache.clear_space(crate::cache::CacheSpace::Query);
        info!(%correlation_id, id = ?created.as_ref().map(|e| &e.id), "entity created");
        Ok(created)
      }
      Err(record) if record.is_aborted() => Err(StoreError::Cancelled),
      Err(record) => {
        warn!(%correlation_id, kind = %record.kind, "create failed: {}", record.message);
        Err(StoreError::SaveFailed(record))
      }
    }
  }

  async fn bulk(&self, entity_ids: &[String], patch: Patch, write: Write) -> BulkOutcome {
    let correlation_id = CorrelationId::new();
    debug!(%correlation_id, entities = entity_ids.len(), "bulk write");

    let results = join_all(entity_ids.iter().map(|id| {
      let patch = patch.clone();
      let correlation_id = correlation_id.clone();
      async move { (id, self.mutate(id, patch, correlation_id, write).await) }
    }))
    .await;

    let mut outcome = BulkOutcome {
      correlation_id,
      applied: Vec::new(),
      failed: Vec::new(),
    };
    for (id, result) in results {
      match result {
        Ok(entity) => outcome.applied.push(entity),
        Err(e) => outcome.failed.push((id.clone(), e)),
      }
    }
    outcome
  }

  async fn mutate(
    &self,
    entity_id: &str,
    patch: Patch,
    correlation_id: CorrelationId,
    write: Write,
  ) -> Result<Entity, StoreError> {
    if self.inner.breaker.is_open() {
      return Err(StoreError::CircuitOpen);
    }

    let (optimistic, token) = {
      let mut state = self.state();
      let current = state
        .table
        .get(entity_id)
        .cloned()
        .ok_or_else(|| StoreError::MissingEntity(entity_id.to_string()))?;
      if state.pending.contains_key(entity_id) {
        return Err(StoreError::MutationInFlight(entity_id.to_string()));
      }

      let optimistic = current.merged(&patch);
      state
        .table
        .insert(entity_id.to_string(), optimistic.clone());
      state.pending.insert(
        entity_id.to_string(),
        PendingMutation {
          correlation_id: correlation_id.clone(),
          entity_id: entity_id.to_string(),
          previous: current,
          patch: patch.clone(),
        },
      );
      (optimistic, state.root.child_token())
    };

    let (path, body) = match write {
      Write::Update => (self.inner.routes.update(entity_id), patch.to_value()),
      Write::SoftDelete => (
        self.inner.routes.soft_delete(entity_id),
        Value::Object(Default::default()),
      ),
    };
    let transport = &self.inner.transport;

    let result = self
      .inner
      .retry
      .run(&correlation_id, &token, || {
        let body = body.clone();
        let path = path.as_str();
        async move { transport.put(path, body).await }
      })
      .await;

    let mut state = self.state();
    // Gone after a reset: the table no longer belongs to this write
    let owned = state
      .pending
      .get(entity_id)
      .is_some_and(|p| p.correlation_id == correlation_id);
    let pending = if owned {
      state.pending.remove(entity_id)
    } else {
      None
    };
    let Some(pending) = pending else {
      return Err(StoreError::Cancelled);
    };

    match result {
      Ok(response) => {
        let confirmed = parse_write_response(response, &self.inner.id_field)
          .filter(|e| e.id == entity_id)
          .unwrap_or(optimistic);
        state.confirm_write(confirmed.clone());
        drop(state);

        self.inner.cache.invalidate_entity(entity_id);
        debug!(%correlation_id, entity_id, "write confirmed");
        Ok(confirmed)
      }
      Err(record) if record.is_aborted() => {
        state.table.insert(entity_id.to_string(), pending.previous);
        Err(StoreError::Cancelled)
      }
      Err(record) => {
        state.table.insert(entity_id.to_string(), pending.previous);
        drop(state);

        warn!(
          %correlation_id,
          entity_id,
          kind = %record.kind,
          "write failed, optimistic change rolled back"
        );
        Err(StoreError::RolledBack {
          entity_id: entity_id.to_string(),
          record,
        })
      }
    }
  }
}
