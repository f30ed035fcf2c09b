use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use neoforge_client::api::{ApiClient, EnvTokenAuth, ReqwestTransport, RequestOptions};
use neoforge_client::{logging, Config, ConnectivityMonitor, EventBus, OfflineCache, Store};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "neoforge")]
#[command(about = "Offline cache, queue and API tooling for the NeoForge frontend")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/neoforge/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show cached item and pending action counts
  Stats,
  /// List queued offline actions
  Pending,
  /// Replay queued offline actions against the API
  Sync,
  /// GET an endpoint through the request layer
  Get {
    endpoint: String,
    /// Serve from cache for this many seconds
    #[arg(long)]
    ttl: Option<u64>,
  },
  /// Drop every cached response
  ClearCache,
  /// Print the persisted application state
  State,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.logging)?;

  let events = EventBus::default();
  let connectivity = ConnectivityMonitor::default();
  let cache = OfflineCache::open(&config.cache);

  let client = ApiClient::builder(
    Arc::new(ReqwestTransport::new()?),
    Arc::new(EnvTokenAuth::from_env()),
  )
  .cache(cache.clone())
  .connectivity(connectivity.clone())
  .events(events.clone())
  .config(&config.api)
  .build();

  info!(base_url = client.base_url(), command = ?args.command, "Starting");

  match args.command {
    Command::Stats => {
      client.probe_health().await;
      print_json(&serde_json::to_value(client.get_cache_stats())?)?;
    }
    Command::Pending => {
      let pending = serde_json::to_value(cache.get_pending_actions())?;
      print_json(&pending)?;
    }
    Command::Sync => {
      if !client.probe_health().await {
        return Err(eyre!("API at {} is unreachable", client.base_url()));
      }
      let report = client.sync_pending_actions().await;
      let failed: Vec<Value> = report
        .failed
        .iter()
        .map(|(id, e)| json!({ "id": id, "error": e.to_string() }))
        .collect();
      print_json(&json!({ "synced": report.synced, "failed": failed }))?;
    }
    Command::Get { endpoint, ttl } => {
      client.probe_health().await;
      let outcome = match ttl {
        Some(secs) => {
          client
            .request_with_cache(&endpoint, RequestOptions::get(), Duration::from_secs(secs))
            .await?
        }
        None => {
          client
            .request_with_timeout(&endpoint, RequestOptions::get(), client.default_timeout())
            .await?
        }
      };
      if let Some(source) = outcome.source() {
        info!(endpoint = %endpoint, source = ?source, "Request complete");
      }
      print_json(&outcome.into_data().unwrap_or(Value::Null))?;
    }
    Command::ClearCache => {
      cache.clear_cache();
      println!("Cache cleared");
    }
    Command::State => {
      let store = Store::builder(json!({}))
        .persistence(cache.clone(), &config.store)
        .events(events.clone())
        .build();
      store.hydrate();
      print_json(&store.get_state())?;
    }
  }

  Ok(())
}

fn print_json(value: &Value) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}
