//! Transport seam between the store and the collection's REST API.

mod http;
#[cfg(test)]
pub(crate) mod mock;

pub use http::HttpTransport;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use url::form_urlencoded;

use crate::error::TransportError;

/// Minimal HTTP surface the store needs. Paths are relative to the API base.
///
/// Implementations attach credentials, enforce timeouts and return the parsed
/// JSON body, or a [`TransportError`] describing what went wrong.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn get(&self, path: &str) -> Result<Value, TransportError>;
  async fn post(&self, path: &str, body: Value) -> Result<Value, TransportError>;
  async fn put(&self, path: &str, body: Value) -> Result<Value, TransportError>;
  async fn delete(&self, path: &str) -> Result<Value, TransportError>;
}

/// Path builder for one collection resource.
#[derive(Debug, Clone)]
pub struct Routes {
  collection: String,
}

impl Routes {
  pub fn new(collection: &str) -> Self {
    Self {
      collection: collection.trim_matches('/').to_string(),
    }
  }

  /// `GET {collection}/{page}/{page_size}`
  pub fn page(&self, page: u32, page_size: u32) -> String {
    format!("{}/{}/{}", self.collection, page, page_size)
  }

  /// `GET {collection}/search?{term}` with filters as extra query pairs.
  pub fn search(&self, term: &str, filters: &BTreeMap<String, String>) -> String {
    let mut query: String = form_urlencoded::byte_serialize(term.trim().as_bytes()).collect();
    if !filters.is_empty() {
      let pairs = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(filters.iter())
        .finish();
      query.push('&');
      query.push_str(&pairs);
    }
    format!("{}/search?{}", self.collection, query)
  }

  /// `POST {collection}/`
  pub fn create(&self) -> String {
    format!("{}/", self.collection)
  }

  /// `PUT {collection}/{id}`
  pub fn update(&self, id: &str) -> String {
    format!("{}/{}", self.collection, encode_segment(id))
  }

  /// `PUT {collection}/{id}/delete`; entities are flagged inactive, never removed.
  pub fn soft_delete(&self, id: &str) -> String {
    format!("{}/{}/delete", self.collection, encode_segment(id))
  }
}

fn encode_segment(segment: &str) -> String {
  form_urlencoded::byte_serialize(segment.as_bytes()).collect()
}
