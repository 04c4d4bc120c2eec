//! Cache-vs-network precedence for GET/HEAD requests.

use async_trait::async_trait;
use color_eyre::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::no_cached_response;
use crate::cache::MatchOptions;
use crate::http::{Request, Response};
use crate::proxy::ProxyContext;

/// Receives the server's answer to a request that was served locally.
pub type ServerResponseCallback = Arc<dyn Fn(&Request, &Response) + Send + Sync>;

#[async_trait]
pub trait FetchStrategy: Send + Sync {
  /// Always resolves to a response unless local storage itself fails.
  async fn fetch(&self, request: &Request, ctx: &Arc<ProxyContext>) -> Result<Response>;
}

/// Settings for the network refresh that runs after a local answer.
#[derive(Clone, Default)]
pub struct BackgroundFetch {
  pub enabled: bool,
  pub callback: Option<ServerResponseCallback>,
}

impl BackgroundFetch {
  pub fn disabled() -> Self {
    Self::default()
  }

  /// Fetch `request` from the server without blocking the caller.
  ///
  /// Successful responses go through the cache strategy and shredder before
  /// the callback sees them. The last response to complete wins.
  pub fn spawn(&self, request: &Request, ctx: &Arc<ProxyContext>) {
    if !self.enabled || !ctx.is_online() {
      return;
    }

    let request = request.clone();
    let ctx = Arc::clone(ctx);
    let callback = self.callback.clone();
    tokio::spawn(async move {
      let response = match ctx.network_fetch(&request).await {
        Ok(response) => response,
        Err(e) => {
          debug!(url = %request.url, "background fetch failed: {}", e);
          return;
        }
      };

      let response = if response.ok() {
        match ctx.process_server_response(&request, response.clone()).await {
          Ok((processed, _)) => processed,
          Err(e) => {
            warn!(url = %request.url, "Failed to store background response: {}", e);
            response
          }
        }
      } else {
        response
      };

      if let Some(callback) = callback {
        callback(&request, &response);
      }
    });
  }

  fn notify(&self, request: &Request, response: &Response) {
    if let Some(callback) = &self.callback {
      callback(request, response);
    }
  }
}

/// Local answer for `request`: the query handler first, then a literal cache
/// match.
pub(crate) async fn local_response(
  request: &Request,
  ctx: &Arc<ProxyContext>,
) -> Result<Option<Response>> {
  if let Some(handler) = &ctx.query_handler {
    match handler.handle(request, ctx).await {
      Ok(Some(response)) => {
        debug!(url = %request.url, "served by query handler");
        return Ok(Some(response));
      }
      Ok(None) => {}
      Err(e) => warn!(url = %request.url, "Query handler failed, falling back to cache: {}", e),
    }
  }

  ctx.cache.match_request(request, MatchOptions::default())
}

/// Serve from local data when possible, otherwise from the network.
///
/// A local hit still triggers `background`. A miss goes to the network and
/// reports the result to the callback. When the network is unreachable the
/// result is a synthesized 503, never an error.
pub async fn fetch_from_cache_or_server_if_empty(
  request: &Request,
  ctx: &Arc<ProxyContext>,
  background: &BackgroundFetch,
) -> Result<Response> {
  if let Some(response) = local_response(request, ctx).await? {
    background.spawn(request, ctx);
    return Ok(response);
  }

  if !ctx.is_online() {
    info!(url = %request.url, "offline with nothing cached");
    return Ok(no_cached_response());
  }

  match ctx.network_fetch(request).await {
    Ok(response) => {
      background.notify(request, &response);
      Ok(response)
    }
    Err(e) => {
      warn!(url = %request.url, "Network fetch failed with nothing cached: {}", e);
      Ok(no_cached_response())
    }
  }
}

/// Network when online; local data when offline, on 5xx, or when the network
/// is unreachable. Client and redirect errors are returned as-is.
#[derive(Debug, Clone, Default)]
pub struct CacheIfOfflineStrategy;

#[async_trait]
impl FetchStrategy for CacheIfOfflineStrategy {
  async fn fetch(&self, request: &Request, ctx: &Arc<ProxyContext>) -> Result<Response> {
    if !ctx.is_online() {
      return fetch_from_cache_or_server_if_empty(request, ctx, &BackgroundFetch::disabled()).await;
    }

    match ctx.network_fetch(request).await {
      Ok(response) if response.ok() || response.status < 500 => Ok(response),
      Ok(response) => {
        info!(url = %request.url, status = response.status, "server error, trying cache");
        Ok(local_response(request, ctx).await?.unwrap_or(response))
      }
      Err(e) => {
        warn!(url = %request.url, "Network fetch failed, trying cache: {}", e);
        Ok(
          local_response(request, ctx)
            .await?
            .unwrap_or_else(no_cached_response),
        )
      }
    }
  }
}

/// Local data first, refreshed from the server in the background.
#[derive(Clone)]
pub struct CacheFirstStrategy {
  background: BackgroundFetch,
}

impl CacheFirstStrategy {
  pub fn new() -> Self {
    Self {
      background: BackgroundFetch {
        enabled: true,
        callback: None,
      },
    }
  }

  /// Skip the background refresh after a local hit.
  pub fn without_background_fetch(mut self) -> Self {
    self.background.enabled = false;
    self
  }

  pub fn with_server_response_callback(mut self, callback: ServerResponseCallback) -> Self {
    self.background.callback = Some(callback);
    self
  }
}

impl Default for CacheFirstStrategy {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl FetchStrategy for CacheFirstStrategy {
  async fn fetch(&self, request: &Request, ctx: &Arc<ProxyContext>) -> Result<Response> {
    fetch_from_cache_or_server_if_empty(request, ctx, &self.background).await
  }
}
