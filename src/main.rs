use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use shelf::config::Config;
use shelf::{
  BulkOutcome, CacheResult, Entity, HttpTransport, NoopSnapshot, Patch, ProductStore,
  SnapshotStore, SqliteSnapshot,
};

#[derive(Parser, Debug)]
#[command(name = "shelf")]
#[command(about = "Resilient client for a REST products collection")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/shelf/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Page loaded before a write when its targets are not known yet
  #[arg(long, global = true, default_value_t = 1)]
  load_page: u32,

  /// Size of the page loaded before a write
  #[arg(long, global = true, default_value_t = 20)]
  load_page_size: u32,

  /// Field filter applied to listings and searches (repeatable)
  #[arg(short, long = "filter", global = true, value_name = "FIELD=VALUE", value_parser = parse_pair)]
  filters: Vec<(String, String)>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List one page of the collection
  List {
    #[arg(default_value_t = 1)]
    page: u32,
    #[arg(long, default_value_t = 20)]
    page_size: u32,
  },
  /// Search the collection
  Search {
    term: String,
    #[arg(long, default_value_t = 20)]
    page_size: u32,
  },
  /// Update one entity
  Patch {
    id: String,
    #[arg(short, long = "set", value_name = "FIELD=VALUE", value_parser = parse_pair, required = true)]
    set: Vec<(String, String)>,
  },
  /// Apply the same update to several entities
  Bulk {
    #[arg(short, long = "set", value_name = "FIELD=VALUE", value_parser = parse_pair, required = true)]
    set: Vec<(String, String)>,
    #[arg(required = true)]
    ids: Vec<String>,
  },
  /// Soft-delete entities
  Deactivate {
    #[arg(required = true)]
    ids: Vec<String>,
  },
  /// Create an entity from a JSON record
  Create { record: String },
}

fn parse_pair(raw: &str) -> Result<(String, String), String> {
  raw
    .split_once('=')
    .map(|(k, v)| (k.trim().to_string(), v.to_string()))
    .filter(|(k, _)| !k.is_empty())
    .ok_or_else(|| format!("expected FIELD=VALUE, got `{}`", raw))
}

/// Values that parse as JSON keep their type; anything else is a string.
fn patch_from(pairs: Vec<(String, String)>) -> Patch {
  pairs.into_iter().fold(Patch::new(), |patch, (field, raw)| {
    let value = serde_json::from_str::<Value>(&raw).unwrap_or(Value::String(raw));
    patch.set(field, value)
  })
}

/// Writes only apply to loaded entities; fetch a page if any target is unknown.
async fn load_targets(
  store: &ProductStore,
  ids: &[String],
  page: u32,
  page_size: u32,
) -> Result<()> {
  if ids.iter().all(|id| store.entity(id).is_some()) {
    return Ok(());
  }
  let result = store.fetch_page(page, page_size).await?;
  if result.is_circuit_open() {
    return Err(eyre!("Backend unavailable (circuit open), try again later"));
  }
  Ok(())
}

fn print_entities(entities: &[Entity]) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(entities)?);
  Ok(())
}

fn print_listing(result: CacheResult<Vec<Entity>>) -> Result<()> {
  if result.is_circuit_open() {
    return Err(eyre!("Backend unavailable (circuit open), try again later"));
  }
  info!(source = ?result.source, "listing loaded");
  print_entities(&result.data)
}

fn report_bulk(outcome: BulkOutcome) -> Result<()> {
  print_entities(&outcome.applied)?;
  for (id, err) in &outcome.failed {
    eprintln!("{}: {}", id, err);
  }
  if outcome.is_complete() {
    Ok(())
  } else {
    Err(eyre!(
      "{} of {} writes failed (correlation {})",
      outcome.failed.len(),
      outcome.failed.len() + outcome.applied.len(),
      outcome.correlation_id
    ))
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = shelf::logging::init(&config.logging)?;

  let token = Config::get_api_token()?;
  let transport = HttpTransport::new(&config.api.url, token, config.request_timeout())?;

  let snapshot: Arc<dyn SnapshotStore> = if config.snapshot.enabled {
    Arc::new(SqliteSnapshot::open(config.snapshot.path.as_deref())?)
  } else {
    Arc::new(NoopSnapshot)
  };

  let store = ProductStore::new(Arc::new(transport), snapshot, config.store_options());
  let restored = store.warm_start();
  if restored > 0 {
    info!(restored, "offline snapshot available");
  }

  if !args.filters.is_empty() {
    store.set_filters(args.filters.into_iter().collect::<BTreeMap<_, _>>());
  }

  match args.command {
    Command::List { page, page_size } => print_listing(store.fetch_page(page, page_size).await?),
    Command::Search { term, page_size } => print_listing(store.search(&term, page_size).await?),
    Command::Patch { id, set } => {
      load_targets(
        &store,
        std::slice::from_ref(&id),
        args.load_page,
        args.load_page_size,
      )
      .await?;
      let entity = store.apply_patch(&id, patch_from(set)).await?;
      print_entities(&[entity])
    }
    Command::Bulk { set, ids } => {
      load_targets(&store, &ids, args.load_page, args.load_page_size).await?;
      report_bulk(store.bulk_apply(&ids, patch_from(set)).await)
    }
    Command::Deactivate { ids } => {
      load_targets(&store, &ids, args.load_page, args.load_page_size).await?;
      report_bulk(store.bulk_deactivate(&ids).await)
    }
    Command::Create { record } => {
      let record: Value =
        serde_json::from_str(&record).map_err(|e| eyre!("Invalid JSON record: {}", e))?;
      match store.create(record).await? {
        Some(entity) => print_entities(&[entity]),
        None => {
          println!("created");
          Ok(())
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_filter_accepted_after_subcommand() {
    let args = Args::try_parse_from(["shelf", "list", "2", "--filter", "category=office"]).unwrap();
    assert_eq!(
      args.filters,
      vec![("category".to_string(), "office".to_string())]
    );
    assert!(matches!(args.command, Command::List { page: 2, .. }));
  }

  #[test]
  fn test_write_page_context_is_configurable() {
    let args = Args::try_parse_from([
      "shelf",
      "patch",
      "7",
      "--set",
      "price=3",
      "--load-page",
      "4",
      "--load-page-size",
      "50",
    ])
    .unwrap();
    assert_eq!(args.load_page, 4);
    assert_eq!(args.load_page_size, 50);

    let defaults = Args::try_parse_from(["shelf", "deactivate", "7"]).unwrap();
    assert_eq!(defaults.load_page, 1);
    assert_eq!(defaults.load_page_size, 20);
  }

  #[test]
  fn test_patch_values_keep_json_types() {
    let patch = patch_from(vec![
      ("price".to_string(), "3".to_string()),
      ("name".to_string(), "blue pen".to_string()),
    ]);
    assert_eq!(
      patch.to_value(),
      serde_json::json!({"price": 3, "name": "blue pen"})
    );
  }
}
