use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::db::Database;
use crate::http::{Connectivity, ReqwestTransport, Transport};
use crate::proxy::DefaultResponseProxy;
use crate::query_handler::{OracleRestQueryHandler, QueryHandler, SimpleQueryHandler};
use crate::shred::{BinaryProcessor, JsonProcessor, OracleRestJsonProcessor, SimpleJsonProcessor};
use crate::strategy::{CacheFirstStrategy, CacheIfOfflineStrategy, FetchStrategy};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  /// SQLite file holding stores, cache and sync log
  pub database_path: Option<PathBuf>,
  pub fetch_strategy: FetchStrategyKind,
  pub background_fetch: BackgroundFetchMode,
  /// Resource whose responses are shredded into a local store
  pub resource: Option<ResourceConfig>,
  pub network: NetworkConfig,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FetchStrategyKind {
  /// Network first, local data when offline or on 5xx
  #[default]
  CacheIfOffline,
  /// Local data first, refreshed in the background
  CacheFirst,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackgroundFetchMode {
  #[default]
  Enabled,
  Disabled,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResourceFormat {
  /// Top-level array or object
  #[default]
  SimpleJson,
  /// `{ "items": [...], "count": n }` envelopes
  OracleRest,
  /// Opaque payloads stored whole
  Binary,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceConfig {
  pub store_name: String,
  /// Collection URL, e.g. https://api.example.com/employees
  pub endpoint: String,
  #[serde(default = "default_id_attribute")]
  pub id_attribute: String,
  #[serde(default)]
  pub format: ResourceFormat,
  /// Serve filtered/paged GETs from the store
  #[serde(default)]
  pub query_handler: bool,
  /// URL parameters that are not filters (simple_json only)
  #[serde(default)]
  pub ignore_url_params: Vec<String>,
}

fn default_id_attribute() -> String {
  "id".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  pub timeout_secs: u64,
  pub user_agent: String,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      timeout_secs: 30,
      user_agent: concat!("persistkit/", env!("CARGO_PKG_VERSION")).to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./persistkit.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/persistkit/config.yaml
  ///
  /// Without a file the defaults apply.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("persistkit.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("persistkit").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Bearer token for outgoing requests, from PERSISTKIT_AUTH_TOKEN.
  pub fn get_auth_token() -> Option<String> {
    std::env::var("PERSISTKIT_AUTH_TOKEN")
      .ok()
      .filter(|token| !token.is_empty())
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database_path {
      Some(path) => Ok(path.clone()),
      None => Database::default_path(),
    }
  }

  pub fn transport(&self) -> Result<ReqwestTransport> {
    ReqwestTransport::new(
      Duration::from_secs(self.network.timeout_secs),
      &self.network.user_agent,
      Self::get_auth_token(),
    )
  }

  pub fn fetch_strategy(&self) -> Arc<dyn FetchStrategy> {
    match self.fetch_strategy {
      FetchStrategyKind::CacheIfOffline => Arc::new(CacheIfOfflineStrategy),
      FetchStrategyKind::CacheFirst => match self.background_fetch {
        BackgroundFetchMode::Enabled => Arc::new(CacheFirstStrategy::new()),
        BackgroundFetchMode::Disabled => {
          Arc::new(CacheFirstStrategy::new().without_background_fetch())
        }
      },
    }
  }

  pub fn json_processor(&self) -> Option<Arc<dyn JsonProcessor>> {
    let resource = self.resource.as_ref()?;
    let processor: Arc<dyn JsonProcessor> = match resource.format {
      ResourceFormat::SimpleJson => Arc::new(SimpleJsonProcessor::new(
        &resource.store_name,
        &resource.id_attribute,
      )),
      ResourceFormat::OracleRest => Arc::new(OracleRestJsonProcessor::new(
        &resource.store_name,
        &resource.id_attribute,
      )),
      ResourceFormat::Binary => Arc::new(BinaryProcessor::new(&resource.store_name)),
    };
    Some(processor)
  }

  pub fn query_handler(&self) -> Result<Option<Arc<dyn QueryHandler>>> {
    let Some(resource) = self.resource.as_ref().filter(|r| r.query_handler) else {
      return Ok(None);
    };

    let handler: Arc<dyn QueryHandler> = match resource.format {
      ResourceFormat::SimpleJson => Arc::new(
        SimpleQueryHandler::new(&resource.endpoint)?.ignoring(resource.ignore_url_params.clone()),
      ),
      ResourceFormat::OracleRest => Arc::new(OracleRestQueryHandler::new(&resource.endpoint)?),
      ResourceFormat::Binary => {
        return Err(eyre!(
          "query_handler is not available for binary resource {}",
          resource.store_name
        ))
      }
    };
    Ok(Some(handler))
  }

  /// Assemble the proxy these settings describe.
  pub fn build_proxy(
    &self,
    db: Arc<Database>,
    transport: Arc<dyn Transport>,
    connectivity: Arc<dyn Connectivity>,
  ) -> Result<DefaultResponseProxy> {
    let mut builder = DefaultResponseProxy::builder(db, transport, connectivity)
      .fetch_strategy(self.fetch_strategy());
    if let Some(processor) = self.json_processor() {
      builder = builder.json_processor(processor);
    }
    if let Some(handler) = self.query_handler()? {
      builder = builder.query_handler(handler);
    }
    Ok(builder.build())
  }
}
