//! Scripted transport for store tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use super::Transport;
use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
  Get,
  Post,
  Put,
  Delete,
}

#[derive(Debug, Clone)]
struct Reply {
  delay: Duration,
  result: Result<Value, TransportError>,
}

/// Replies are queued per (verb, path); the last queued reply repeats.
#[derive(Default)]
pub struct MockTransport {
  replies: Mutex<HashMap<(Verb, String), VecDeque<Reply>>>,
  calls: Mutex<Vec<(Verb, String, Option<Value>)>>,
}

impl MockTransport {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn reply(&self, verb: Verb, path: &str, result: Result<Value, TransportError>) {
    self.reply_after(verb, path, Duration::ZERO, result);
  }

  pub fn reply_after(
    &self,
    verb: Verb,
    path: &str,
    delay: Duration,
    result: Result<Value, TransportError>,
  ) {
    self
      .replies
      .lock()
      .unwrap()
      .entry((verb, path.to_string()))
      .or_default()
      .push_back(Reply { delay, result });
  }

  pub fn calls(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  pub fn calls_to(&self, verb: Verb, path: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|(v, p, _)| *v == verb && p == path)
      .count()
  }

  pub fn last_body(&self, verb: Verb, path: &str) -> Option<Value> {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .rev()
      .find(|(v, p, _)| *v == verb && p == path)
      .and_then(|(_, _, body)| body.clone())
  }

  async fn respond(
    &self,
    verb: Verb,
    path: &str,
    body: Option<Value>,
  ) -> Result<Value, TransportError> {
    self
      .calls
      .lock()
      .unwrap()
      .push((verb, path.to_string(), body));

    let reply = {
      let mut replies = self.replies.lock().unwrap();
      match replies.get_mut(&(verb, path.to_string())) {
        Some(queue) if queue.len() > 1 => queue.pop_front(),
        Some(queue) => queue.front().cloned(),
        None => None,
      }
    };

    let reply = reply.unwrap_or(Reply {
      delay: Duration::ZERO,
      result: Err(TransportError::Status {
        status: 404,
        body: format!("no reply scripted for {:?} {}", verb, path),
      }),
    });

    if !reply.delay.is_zero() {
      tokio::time::sleep(reply.delay).await;
    }
    reply.result
  }
}

#[async_trait]
impl Transport for MockTransport {
  async fn get(&self, path: &str) -> Result<Value, TransportError> {
    self.respond(Verb::Get, path, None).await
  }

  async fn post(&self, path: &str, body: Value) -> Result<Value, TransportError> {
    self.respond(Verb::Post, path, Some(body)).await
  }

  async fn put(&self, path: &str, body: Value) -> Result<Value, TransportError> {
    self.respond(Verb::Put, path, Some(body)).await
  }

  async fn delete(&self, path: &str) -> Result<Value, TransportError> {
    self.respond(Verb::Delete, path, None).await
  }
}
