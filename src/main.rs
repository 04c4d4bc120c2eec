use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use persistkit::cache::ResponseCache;
use persistkit::config::Config;
use persistkit::db::Database;
use persistkit::http::{Method, OnlineFlag, Request, Response};
use persistkit::store::{Selector, StoreManager};
use persistkit::sync::SyncLog;

#[derive(Parser, Debug)]
#[command(name = "persistkit")]
#[command(about = "Offline-first HTTP proxy with a local cache, shredded stores and a sync log")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/persistkit/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Behave as if the network were unreachable
  #[arg(long)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Send requests through the proxy and print the responses
  Fetch {
    /// HTTP method
    method: String,
    /// One or more URLs, fetched concurrently
    #[arg(required = true)]
    urls: Vec<String>,
    /// Request header, `Name: value`
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    /// Request body
    #[arg(short = 'd', long = "data")]
    data: Option<String>,
  },
  /// Inspect and replay queued mutations
  Sync {
    #[command(subcommand)]
    action: SyncAction,
  },
  /// Inspect the response cache
  Cache {
    #[command(subcommand)]
    action: CacheAction,
  },
  /// Inspect shredded stores
  Store {
    #[command(subcommand)]
    action: StoreAction,
  },
}

#[derive(Subcommand, Debug)]
enum SyncAction {
  List,
  /// Send queued requests to the server in order
  Replay,
  /// Revert the local rows changed by an entry
  Undo { id: i64 },
  /// Re-apply the local rows changed by an entry
  Redo { id: i64 },
  /// Drop an entry without sending it
  Remove { id: i64 },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
  List,
  Clear,
}

#[derive(Subcommand, Debug)]
enum StoreAction {
  List,
  /// Print every row of a store
  Dump { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let db_path = config.database_path()?;
  let _guard = init_logging(&db_path)?;

  let db = Arc::new(Database::open(&db_path)?);
  let online = Arc::new(OnlineFlag::new(!args.offline));
  info!(db = %db_path.display(), online = !args.offline, "starting");

  match args.command {
    Command::Fetch {
      method,
      urls,
      headers,
      data,
    } => {
      let transport = Arc::new(config.transport()?);
      let proxy = config.build_proxy(Arc::clone(&db), transport, online)?;
      let method: Method = method.parse()?;

      let requests = urls
        .iter()
        .map(|url| build_request(method, url, &headers, data.as_deref()))
        .collect::<Result<Vec<_>>>()?;
      let responses = join_all(requests.iter().map(|r| proxy.process_request(r))).await;

      for (request, response) in requests.iter().zip(responses) {
        if requests.len() > 1 {
          println!("==> {} {}", request.method, request.url);
        }
        print_response(&response?);
      }
    }

    Command::Sync { action } => {
      let sync_log = SyncLog::new(Arc::clone(&db));
      match action {
        SyncAction::List => {
          for entry in sync_log.entries()? {
            println!(
              "{}\t{}\t{} {}\t{} store change(s)",
              entry.id,
              entry.created_at,
              entry.request.method,
              entry.request.url,
              entry.undo_redo.len()
            );
          }
        }
        SyncAction::Replay => {
          let transport = config.transport()?;
          let report = sync_log.sync(&transport, online.as_ref()).await?;
          println!(
            "replayed {}, remaining {}{}",
            report.replayed,
            report.remaining,
            report
              .failed
              .map(|id| format!(", stopped at {}", id))
              .unwrap_or_default()
          );
        }
        SyncAction::Undo { id } => sync_log.undo(id)?,
        SyncAction::Redo { id } => sync_log.redo(id)?,
        SyncAction::Remove { id } => {
          if !sync_log.remove_request(id)? {
            return Err(eyre!("No sync entry with id {}", id));
          }
        }
      }
    }

    Command::Cache { action } => {
      let cache = ResponseCache::new(Arc::clone(&db));
      match action {
        CacheAction::List => {
          for entry in cache.keys()? {
            println!("{}\t{} {}", entry.cached_at, entry.method, entry.url);
          }
        }
        CacheAction::Clear => println!("removed {} cache entries", cache.clear()?),
      }
    }

    Command::Store { action } => {
      let stores = StoreManager::new(Arc::clone(&db));
      match action {
        StoreAction::List => {
          for name in stores.store_names()? {
            println!("{}", name);
          }
        }
        StoreAction::Dump { name } => {
          for row in stores.open_store(&name)?.find(&Selector::all())? {
            println!("{}\t{}", row.key, row.value);
          }
        }
      }
    }
  }

  Ok(())
}

/// Log to a daily file next to the database; stdout is command output.
fn init_logging(db_path: &Path) -> Result<WorkerGuard> {
  let log_dir = db_path
    .parent()
    .map(Path::to_path_buf)
    .unwrap_or_else(|| PathBuf::from("."));
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "persistkit.log"));
  let filter =
    EnvFilter::try_from_env("PERSISTKIT_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .with_target(false)
    .init();

  Ok(guard)
}

fn build_request(
  method: Method,
  url: &str,
  headers: &[String],
  data: Option<&str>,
) -> Result<Request> {
  let mut request = Request::parse(method, url)?;
  for header in headers {
    let (name, value) = header
      .split_once(':')
      .ok_or_else(|| eyre!("Invalid header '{}', expected 'Name: value'", header))?;
    request.headers.append(name.trim(), value.trim());
  }
  if let Some(data) = data {
    request.body = data.as_bytes().to_vec().into();
  }
  Ok(request)
}

fn print_response(response: &Response) {
  println!(
    "{} {}{}",
    response.status,
    response.status_text,
    if response.is_cached { " (local)" } else { "" }
  );
  for (name, value) in response.headers.iter() {
    println!("{}: {}", name, value);
  }
  println!();
  println!("{}", response.text());
}
