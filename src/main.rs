use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use offsync::clock::SystemClock;
use offsync::notify::LogNotifier;
use offsync::storage::{KvStorage, SqliteStorage};
use offsync::{
  Config, ConnectivityMonitor, CoordinatorOptions, EngineOptions, HttpNetwork, Method,
  ReachabilityProbe, Request, Response, RouteTable, SyncCoordinator, SyncEngine,
};

#[derive(Parser, Debug)]
#[command(name = "offsync")]
#[command(about = "Offline-first cache and write queue for a REST backend")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Read an API route through the cache
  Get { path: String },
  /// Load a page, falling back to the saved copy when slow or offline
  Page { path: String },
  /// Send a write; it is queued if the backend is unreachable
  Send {
    /// HTTP method (POST, PUT, PATCH or DELETE)
    method: String,
    path: String,
    #[arg(short, long)]
    body: Option<String>,
  },
  /// List queued writes
  Queue,
  /// Replay queued writes now
  Drain,
  /// Show cache and queue statistics
  Stats,
  /// Drop cached data
  Clear {
    /// Also drop queued writes
    #[arg(long)]
    queue: bool,
  },
  /// Watch connectivity and sync whenever the backend comes back
  Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;

  let storage_path = match &config.storage.path {
    Some(path) => path.clone(),
    None => SqliteStorage::default_path()?,
  };
  let _log_guard = init_logging(&storage_path)?;

  let storage = Arc::new(SqliteStorage::open(&storage_path, config.storage.max_bytes)?);
  let mut network = HttpNetwork::new(
    &config.backend.base_url,
    Duration::from_millis(config.backend.request_timeout_ms),
  )?;
  if let Some(token) = Config::session_token() {
    network = network.with_session_header("Authorization", format!("Bearer {}", token));
  }

  let engine = Arc::new(SyncEngine::new(
    Arc::new(network),
    storage.clone(),
    RouteTable::from_config(&config),
    Arc::new(SystemClock),
    EngineOptions::from_config(&config),
  )?);

  match args.command {
    Command::Get { path } => print_response(&engine.handle(Request::get(path)).await?),
    Command::Page { path } => print_response(&engine.handle(Request::document(path)).await?),
    Command::Send { method, path, body } => {
      let method: Method = method.parse()?;
      if !method.is_write() {
        return Err(eyre!("{} is not a write method", method));
      }
      let mut request = Request::new(method, path);
      if let Some(body) = body {
        request = request
          .with_body(body)
          .with_header("Content-Type", "application/json");
      }
      print_response(&engine.handle(request).await?);
    }
    Command::Queue => {
      let items = engine.queue().items()?;
      if items.is_empty() {
        println!("Queue is empty");
      }
      for item in items {
        println!(
          "{}  {:<6} {}  queued {}  retries {}",
          item.id,
          item.method,
          item.url,
          item.enqueued_at.to_rfc3339(),
          item.retry_count
        );
      }
    }
    Command::Drain => {
      let monitor = ConnectivityMonitor::new(true, Arc::new(SystemClock));
      let coordinator = SyncCoordinator::new(
        engine.clone(),
        monitor,
        Arc::new(LogNotifier),
        CoordinatorOptions::from_config(&config),
      );
      let summary = coordinator.sync_now().await?;
      println!(
        "Replayed {}, retrying {}, lost {}",
        summary.replayed,
        summary.retrying,
        summary.lost.len()
      );
      for lost in &summary.lost {
        println!("  lost {} {}: {}", lost.method, lost.url, lost.reason);
      }
    }
    Command::Stats => {
      for (label, cache) in [("data", engine.cache()), ("pages", engine.pages())] {
        let stats = cache.stats()?;
        println!(
          "{:<6} {} entries, ~{} bytes, oldest {}, newest {}",
          label,
          stats.count,
          stats.approx_size_bytes,
          stats.oldest_key.as_deref().unwrap_or("-"),
          stats.newest_key.as_deref().unwrap_or("-")
        );
      }
      println!("queue  {} pending", engine.queue().size());
      let usage = storage.usage()?;
      match usage.quota_bytes {
        Some(quota) => println!("store  {} / {} bytes", usage.used_bytes, quota),
        None => println!("store  {} bytes", usage.used_bytes),
      }
    }
    Command::Clear { queue } => {
      let removed = engine.cache().clear()? + engine.pages().clear()?;
      println!("Removed {} cached entries", removed);
      if queue {
        println!("Dropped {} queued writes", engine.queue().clear()?);
      }
    }
    Command::Watch => watch(engine.clone(), &config).await?,
  }

  engine.settle().await;
  Ok(())
}

async fn watch(engine: Arc<SyncEngine>, config: &Config) -> Result<()> {
  // Start offline so the first successful probe triggers a sync
  let monitor = ConnectivityMonitor::new(false, Arc::new(SystemClock));
  let coordinator = SyncCoordinator::new(
    engine,
    monitor.clone(),
    Arc::new(LogNotifier),
    CoordinatorOptions::from_config(config),
  )
  .spawn();

  let interval = Duration::from_millis(config.sync.probe_interval_ms);
  let probe = ReachabilityProbe::for_url(&config.backend.base_url, interval, interval.min(Duration::from_secs(5)))?
    .spawn(monitor);

  println!("Watching {} (Ctrl-C to stop)", config.backend.base_url);
  tokio::signal::ctrl_c().await?;
  info!("shutting down");

  probe.abort();
  coordinator.abort();
  Ok(())
}

fn print_response(response: &Response) {
  println!("{} ({:?})", response.status, response.source);
  if let Some(cached_at) = response.cached_at {
    println!("cached at {}", cached_at.to_rfc3339());
  }
  println!("{}", response.body);
}

/// Log to a daily file next to the store, keeping stdout for command output.
fn init_logging(storage_path: &Path) -> Result<tracing_appender::non_blocking::WorkerGuard> {
  let log_dir = storage_path
    .parent()
    .map(|dir| dir.join("logs"))
    .ok_or_else(|| eyre!("Storage path has no parent: {}", storage_path.display()))?;
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&log_dir, "offsync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_env("OFFSYNC_LOG").unwrap_or_else(|_| EnvFilter::new("offsync=info")),
    )
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}
