use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{Client, Method};
use serde_json::Value;
use std::time::Duration;
use url::Url;

use super::Transport;
use crate::error::TransportError;

/// reqwest-backed transport sending a bearer credential on every call.
#[derive(Clone)]
pub struct HttpTransport {
  client: Client,
  base: Url,
  token: String,
}

impl HttpTransport {
  pub fn new(base_url: &str, token: String, timeout: Duration) -> Result<Self> {
    // Url::join drops the last path segment unless the base ends with '/'
    let normalized = if base_url.ends_with('/') {
      base_url.to_string()
    } else {
      format!("{}/", base_url)
    };
    let base =
      Url::parse(&normalized).map_err(|e| eyre!("Invalid API url {}: {}", base_url, e))?;

    let client = Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base,
      token,
    })
  }

  async fn send(
    &self,
    method: Method,
    path: &str,
    body: Option<Value>,
  ) -> Result<Value, TransportError> {
    let url = self
      .base
      .join(path)
      .map_err(|e| TransportError::Decode(format!("invalid path {}: {}", path, e)))?;

    let mut request = self
      .client
      .request(method, url)
      .bearer_auth(&self.token);
    if let Some(body) = body {
      request = request.json(&body);
    }

    let response = request.send().await.map_err(map_reqwest_error)?;
    let status = response.status();
    let bytes = response.bytes().await.map_err(map_reqwest_error)?;

    if !status.is_success() {
      return Err(TransportError::Status {
        status: status.as_u16(),
        body: String::from_utf8_lossy(&bytes).into_owned(),
      });
    }

    if bytes.iter().all(u8::is_ascii_whitespace) {
      return Ok(Value::Null);
    }
    serde_json::from_slice(&bytes).map_err(|e| TransportError::Decode(e.to_string()))
  }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
  if err.is_timeout() {
    return TransportError::Timeout;
  }
  if err.is_connect() {
    let message = full_message(&err);
    if message.contains("dns error") || message.contains("failed to lookup address") {
      return TransportError::Dns(message);
    }
    return TransportError::Connect(message);
  }
  if err.is_decode() || err.is_body() {
    return TransportError::Decode(err.to_string());
  }
  // A connection dropped mid-request surfaces as an io error in the chain
  if err.is_request() && has_io_cause(&err) {
    return TransportError::Connect(full_message(&err));
  }
  TransportError::Request(full_message(&err))
}

fn has_io_cause(err: &reqwest::Error) -> bool {
  let mut source = std::error::Error::source(err);
  while let Some(cause) = source {
    if cause.is::<std::io::Error>() {
      return true;
    }
    source = cause.source();
  }
  false
}

/// reqwest hides the root cause (e.g. the DNS failure) in the source chain.
fn full_message(err: &reqwest::Error) -> String {
  let mut message = err.to_string();
  let mut source = std::error::Error::source(err);
  while let Some(cause) = source {
    message.push_str(": ");
    message.push_str(&cause.to_string());
    source = cause.source();
  }
  message
}

#[async_trait]
impl Transport for HttpTransport {
  async fn get(&self, path: &str) -> Result<Value, TransportError> {
    self.send(Method::GET, path, None).await
  }

  async fn post(&self, path: &str, body: Value) -> Result<Value, TransportError> {
    self.send(Method::POST, path, Some(body)).await
  }

  async fn put(&self, path: &str, body: Value) -> Result<Value, TransportError> {
    self.send(Method::PUT, path, Some(body)).await
  }

  async fn delete(&self, path: &str) -> Result<Value, TransportError> {
    self.send(Method::DELETE, path, None).await
  }
}
