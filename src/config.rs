use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CachePolicy;
use crate::resilience::{CircuitPolicy, RetryPolicy};
use crate::store::StoreOptions;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub circuit: CircuitConfig,
  #[serde(default)]
  pub retry: RetryConfig,
  #[serde(default)]
  pub snapshot: SnapshotConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base url of the REST API, e.g. "https://shop.example.com/api/"
  pub url: String,
  /// Collection resource name
  #[serde(default = "default_collection")]
  pub collection: String,
  /// Field holding each record's identifier
  #[serde(default = "default_id_field")]
  pub id_field: String,
  /// Per-request timeout enforced by the transport
  #[serde(default = "default_timeout_ms")]
  pub timeout_ms: u64,
}

fn default_collection() -> String {
  "products".to_string()
}

fn default_id_field() -> String {
  "id".to_string()
}

fn default_timeout_ms() -> u64 {
  15_000
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub ttl_ms: u64,
  pub page_capacity: usize,
  pub query_capacity: usize,
}

impl Default for CacheConfig {
  fn default() -> Self {
    let policy = CachePolicy::default();
    Self {
      ttl_ms: policy.ttl.as_millis() as u64,
      page_capacity: policy.page_capacity,
      query_capacity: policy.query_capacity,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
  pub threshold: u32,
  pub cooldown_ms: u64,
}

impl Default for CircuitConfig {
  fn default() -> Self {
    let policy = CircuitPolicy::default();
    Self {
      threshold: policy.threshold,
      cooldown_ms: policy.cooldown.as_millis() as u64,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  pub max_attempts: u32,
  pub base_delay_ms: u64,
  /// Force a single attempt without delay (automated runs)
  pub deterministic: bool,
}

impl Default for RetryConfig {
  fn default() -> Self {
    let policy = RetryPolicy::default();
    Self {
      max_attempts: policy.max_attempts,
      base_delay_ms: policy.base_delay.as_millis() as u64,
      deterministic: false,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
  pub enabled: bool,
  /// Defaults to $XDG_DATA_HOME/shelf/snapshot.db
  pub path: Option<PathBuf>,
}

impl Default for SnapshotConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      path: None,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// tracing filter directive, e.g. "shelf=debug"
  pub filter: Option<String>,
  /// Write logs to this file instead of stderr
  pub file: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shelf.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shelf/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/shelf/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("shelf.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shelf").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.circuit.threshold == 0 {
      return Err(eyre!("circuit.threshold must be at least 1"));
    }
    Ok(config)
  }

  /// Get the API bearer token from environment variables.
  ///
  /// Checks SHELF_API_TOKEN first, then API_TOKEN as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("SHELF_API_TOKEN")
      .or_else(|_| std::env::var("API_TOKEN"))
      .map_err(|_| {
        eyre!("API token not found. Set SHELF_API_TOKEN or API_TOKEN environment variable.")
      })
  }

  /// Whether SHELF_DETERMINISTIC_RETRY forces single-attempt retries.
  fn deterministic_from_env() -> bool {
    std::env::var("SHELF_DETERMINISTIC_RETRY")
      .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
      .unwrap_or(false)
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_millis(self.api.timeout_ms)
  }

  /// Store tunables derived from this configuration.
  pub fn store_options(&self) -> StoreOptions {
    let retry = if self.retry.deterministic || Self::deterministic_from_env() {
      RetryPolicy::deterministic()
    } else {
      RetryPolicy {
        max_attempts: self.retry.max_attempts,
        base_delay: Duration::from_millis(self.retry.base_delay_ms),
        ..RetryPolicy::default()
      }
    };

    StoreOptions {
      collection: self.api.collection.clone(),
      id_field: self.api.id_field.clone(),
      cache: CachePolicy {
        ttl: Duration::from_millis(self.cache.ttl_ms),
        page_capacity: self.cache.page_capacity,
        query_capacity: self.cache.query_capacity,
      },
      circuit: CircuitPolicy {
        threshold: self.circuit.threshold,
        cooldown: Duration::from_millis(self.circuit.cooldown_ms),
      },
      retry,
    }
  }
}
