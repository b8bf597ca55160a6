//! Entity records as returned by the collection endpoints.
//!
//! The store never interprets entity fields beyond the identifier; records are
//! kept as the JSON the backend sent.

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::cache::Cacheable;
use crate::error::TransportError;

/// One entity in the collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
  pub id: String,
  pub record: Value,
}

impl Entity {
  pub fn new(id: impl Into<String>, record: Value) -> Self {
    Self {
      id: id.into(),
      record,
    }
  }

  /// Build an entity from a backend record, reading its id from `id_field`.
  /// Numeric ids are stringified.
  pub fn from_record(record: Value, id_field: &str) -> Result<Self, TransportError> {
    let id = match record.get(id_field) {
      Some(Value::String(s)) => s.clone(),
      Some(Value::Number(n)) => n.to_string(),
      _ => {
        return Err(TransportError::Decode(format!(
          "record has no `{}` field",
          id_field
        )))
      }
    };
    Ok(Self { id, record })
  }

  /// `{...self, ...patch}`: shallow merge, patch fields win.
  pub fn merged(&self, patch: &Patch) -> Entity {
    let mut fields = match &self.record {
      Value::Object(map) => map.clone(),
      _ => Map::new(),
    };
    for (k, v) in &patch.0 {
      fields.insert(k.clone(), v.clone());
    }
    Entity::new(self.id.clone(), Value::Object(fields))
  }

  pub fn field(&self, name: &str) -> Option<&Value> {
    self.record.get(name)
  }

  /// Equality on the string form of each filtered field.
  pub fn matches(&self, filters: &BTreeMap<String, String>) -> bool {
    filters.iter().all(|(name, expected)| match self.field(name) {
      Some(Value::String(s)) => s == expected,
      Some(other) => other.to_string() == *expected,
      None => false,
    })
  }
}

impl Serialize for Entity {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    self.record.serialize(serializer)
  }
}

impl Cacheable for Entity {
  fn cache_key(&self) -> &str {
    &self.id
  }
}

/// Parse a listing/search response body into entities.
///
/// Accepts a bare array or an object wrapping one under `items`/`data`.
pub fn parse_list(body: Value, id_field: &str) -> Result<Vec<Entity>, TransportError> {
  let items = match body {
    Value::Array(items) => items,
    Value::Object(mut map) => match map.remove("items").or_else(|| map.remove("data")) {
      Some(Value::Array(items)) => items,
      _ => return Err(TransportError::Decode("expected a list of records".into())),
    },
    Value::Null => Vec::new(),
    _ => return Err(TransportError::Decode("expected a list of records".into())),
  };

  items
    .into_iter()
    .map(|record| Entity::from_record(record, id_field))
    .collect()
}

/// Write responses are either the stored record or a message-only acknowledgment.
pub fn parse_write_response(body: Value, id_field: &str) -> Option<Entity> {
  if body.get(id_field).is_some() {
    Entity::from_record(body, id_field).ok()
  } else {
    None
  }
}

/// A partial update applied on top of an entity record.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Patch(pub Map<String, Value>);

impl Patch {
  pub fn new() -> Self {
    Self(Map::new())
  }

  pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
    self.0.insert(field.into(), value.into());
    self
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn to_value(&self) -> Value {
    Value::Object(self.0.clone())
  }

  /// Patch used for soft deletion.
  pub fn deactivate() -> Self {
    Self::new().set("active", false)
  }
}
