use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use tiercache::clock::{Clock, SystemClock};
use tiercache::config::Config;
use tiercache::db::Database;
use tiercache::event::{Event, EventHandler};
use tiercache::logging;
use tiercache::net::{Destination, ReqwestTransport, Request, Transport};
use tiercache::sw::{OfflineWorker, SqliteStorage, WorkerState};
use tiercache::{use_query, RequestCache};

#[derive(Parser, Debug)]
#[command(name = "tiercache")]
#[command(about = "A two-tier offline cache for HTTP resources")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tiercache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Cache version to run as, overriding the config file
  #[arg(long)]
  cache_version: Option<String>,

  /// Mirror logs to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the configured resources for the current version
  Install,
  /// Activate a waiting version right away
  SkipWaiting,
  /// Fetch a resource through the offline worker
  Fetch {
    url: String,
    /// Treat the request as a top-level navigation
    #[arg(long)]
    navigate: bool,
    /// Declared destination of the request
    #[arg(long, value_enum)]
    dest: Option<Destination>,
  },
  /// Fetch a JSON resource through the request cache
  Get { url: String },
  /// Poll a JSON resource and print it whenever it changes
  Watch {
    url: String,
    #[arg(long, default_value_t = 5000)]
    interval_ms: u64,
  },
  /// List buckets and their entry counts
  Buckets,
  /// Delete every runtime bucket, keeping the precache
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Override version if specified on command line
  let config = if let Some(version) = args.cache_version {
    Config {
      cache_version: version,
      ..config
    }
  } else {
    config
  };

  let _log_guard = logging::init(&config.log, args.verbose)?;
  info!(version = %config.cache_version, command = ?args.command, "starting");

  let storage = Arc::new(SqliteStorage::new(Database::open(config.database.as_deref())?));
  let clock: Arc<dyn Clock> = Arc::new(SystemClock);
  let network: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(config.network_timeout())?);
  let worker = Arc::new(OfflineWorker::new(&config, storage, Arc::clone(&clock), network)?);

  match args.command {
    Command::Install => {
      let state = worker.install().await?;
      println!("{}: {}", config.cache_version, state);
      if state == WorkerState::Waiting {
        println!("another version is active; run `tiercache skip-waiting` to take over");
      }
    }
    Command::SkipWaiting => {
      match worker.post_message(r#"{"type":"SKIP_WAITING"}"#).await? {
        Some(report) => {
          for bucket in &report.deleted_buckets {
            println!("deleted {}", bucket);
          }
          println!("{}: {}", config.cache_version, worker.state().await);
        }
        None => println!("{}: {} (nothing to do)", config.cache_version, worker.state().await),
      }
    }
    Command::Fetch { url, navigate, dest } => {
      let mut request = Request::get_str(&url)?;
      if navigate {
        request = request.navigate();
      }
      if let Some(dest) = dest {
        request = request.with_destination(dest);
      }
      let result = worker.handle_fetch(&request).await?;
      eprintln!(
        "{} {:?} class={:?}",
        result.data.status,
        result.source,
        worker.router().classify(&request)
      );
      println!("{}", result.data.text());
    }
    Command::Get { url } => {
      let cache: RequestCache<serde_json::Value> =
        RequestCache::new(worker.clone(), clock, config.request_cache.fetch_options());
      let value = cache.fetch_url(&url).await?;
      println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Command::Watch { url, interval_ms } => {
      let cache: RequestCache<serde_json::Value> =
        RequestCache::new(worker.clone(), clock, config.request_cache.fetch_options());
      let mut query_config = config.query.query_config(config.request_cache.fetch_options());
      query_config.refetch_interval = Some(Duration::from_millis(interval_ms));
      watch(use_query(&cache, &url, query_config)?).await?;
    }
    Command::Buckets => {
      for (name, len) in worker.bucket_sizes()? {
        println!("{:<24} {}", name, len);
      }
    }
    Command::Clear => {
      for bucket in worker.clear_runtime().await? {
        println!("deleted {}", bucket);
      }
    }
  }

  Ok(())
}

async fn watch(mut query: tiercache::QueryController<serde_json::Value>) -> Result<()> {
  let mut events = EventHandler::new(Duration::from_millis(100));
  let mut last: Option<serde_json::Value> = None;

  while let Some(event) = events.next().await {
    match event {
      Event::Interrupt => break,
      Event::Tick => {
        if !query.poll() {
          continue;
        }
        if let Some(error) = query.error().filter(|_| query.is_error()) {
          eprintln!("error: {}", error);
        } else if let Some(data) = query.data().filter(|d| last.as_ref() != Some(*d)) {
          println!("{}", serde_json::to_string_pretty(data)?);
          last = Some(data.clone());
        }
      }
    }
  }

  Ok(())
}
