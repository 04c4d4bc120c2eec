//! Per-method request handling.

use async_trait::async_trait;
use chrono::Utc;
use color_eyre::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::ProxyContext;
use crate::http::{Method, Request, Response};
use crate::query_handler::unshred_rows;
use crate::shred::ResourceType;
use crate::store::StoreRow;
use crate::strategy::FetchStrategy;

/// Application-supplied handling for individual methods.
///
/// Returning `Ok(None)` leaves the request to the default handler.
#[async_trait]
pub trait RequestHandlerOverride: Send + Sync {
  async fn handle_get(&self, _request: &Request) -> Result<Option<Response>> {
    Ok(None)
  }

  async fn handle_head(&self, _request: &Request) -> Result<Option<Response>> {
    Ok(None)
  }

  async fn handle_post(&self, _request: &Request) -> Result<Option<Response>> {
    Ok(None)
  }

  async fn handle_put(&self, _request: &Request) -> Result<Option<Response>> {
    Ok(None)
  }

  async fn handle_patch(&self, _request: &Request) -> Result<Option<Response>> {
    Ok(None)
  }

  async fn handle_delete(&self, _request: &Request) -> Result<Option<Response>> {
    Ok(None)
  }

  async fn handle_options(&self, _request: &Request) -> Result<Option<Response>> {
    Ok(None)
  }
}

pub(crate) async fn run_override(
  handler: &dyn RequestHandlerOverride,
  request: &Request,
) -> Result<Option<Response>> {
  match request.method {
    Method::Get => handler.handle_get(request).await,
    Method::Head => handler.handle_head(request).await,
    Method::Post => handler.handle_post(request).await,
    Method::Put => handler.handle_put(request).await,
    Method::Patch => handler.handle_patch(request).await,
    Method::Delete => handler.handle_delete(request).await,
    Method::Options => handler.handle_options(request).await,
  }
}

/// Response chosen for a request, before post-processing.
pub(crate) struct Handled {
  pub response: Response,
  /// The server never saw the request; it has to be queued for sync
  pub deferred: bool,
}

impl Handled {
  fn live(response: Response) -> Self {
    Self {
      response,
      deferred: false,
    }
  }
}

/// 503 for methods that cannot be answered offline without an override.
pub fn offline_not_supported() -> Response {
  Response::synthetic(503, "Must provide override for offline", "")
}

pub(crate) async fn handle_get(
  request: &Request,
  ctx: &Arc<ProxyContext>,
  fetch_strategy: &dyn FetchStrategy,
) -> Result<Handled> {
  fetch_strategy.fetch(request, ctx).await.map(Handled::live)
}

/// POST, PATCH and OPTIONS only work online.
pub(crate) async fn handle_pass_through(request: &Request, ctx: &ProxyContext) -> Result<Handled> {
  if !ctx.is_online() {
    info!(method = %request.method, url = %request.url, "no offline handling for method");
    return Ok(Handled::live(offline_not_supported()));
  }
  ctx.network_fetch(request).await.map(Handled::live)
}

/// PUT and DELETE go to the network when possible and are answered locally
/// when offline, on a 5xx, or when the server is unreachable.
pub(crate) async fn handle_put_or_delete(request: &Request, ctx: &ProxyContext) -> Result<Handled> {
  if ctx.is_online() {
    match ctx.network_fetch(request).await {
      Ok(response) if response.ok() || response.status < 500 => {
        return Ok(Handled::live(response));
      }
      Ok(response) => {
        warn!(url = %request.url, status = response.status, "server error, answering locally");
      }
      Err(e) => warn!(url = %request.url, "Network fetch failed, answering locally: {}", e),
    }
  }

  Ok(Handled {
    response: offline_response(request, ctx)?,
    deferred: true,
  })
}

/// Synthesize the 200 a server would have sent for a PUT or DELETE.
///
/// PUT echoes the request body, DELETE returns the stored row addressed by
/// the URL. Conditional headers are dropped and replaced by a fresh ETag.
pub(crate) fn offline_response(request: &Request, ctx: &ProxyContext) -> Result<Response> {
  let mut response = Response::new(200, "OK").with_url(request.url.as_str());
  response.headers = request.headers.clone();
  response.headers.remove("Content-Length");

  let conditional =
    request.headers.contains("If-Match") || request.headers.contains("If-None-Match");
  if conditional {
    response.headers.remove("If-Match");
    response.headers.remove("If-None-Match");
    response.headers.set("ETag", synthetic_etag());
  }
  if !response.headers.contains("Content-Type") {
    response.headers.set("Content-Type", "application/json");
  }

  if request.method == Method::Delete {
    if let Some(stored) = stored_row(request, &response, ctx)? {
      response = stored;
    }
  } else {
    response.body = request.body.clone();
  }

  debug!(method = %request.method, url = %request.url, "synthesized offline response");
  Ok(response)
}

/// Strong ETag from the current time and a random suffix.
fn synthetic_etag() -> String {
  format!(
    "\"{}-{:08x}\"",
    Utc::now().timestamp_millis(),
    rand::random::<u32>()
  )
}

/// Last known data of the row a DELETE addresses, keyed by the final path
/// segment (or the whole URL for binary rows), rebuilt by the processor on
/// top of `template`.
fn stored_row(
  request: &Request,
  template: &Response,
  ctx: &ProxyContext,
) -> Result<Option<Response>> {
  let Some(processor) = ctx.json_processor.as_deref() else {
    return Ok(None);
  };
  let store = ctx.stores.open_store(processor.store_name())?;

  let candidates = request
    .last_path_segment()
    .into_iter()
    .chain(std::iter::once(request.url.to_string()));
  for key in candidates {
    let Some(value) = store.find_by_key(&key)? else {
      continue;
    };
    let row = StoreRow { key, value };
    let mut response = unshred_rows(processor, vec![row], ResourceType::Single, template)?;
    // Still has to be shredded so the row is removed locally
    response.is_cached = false;
    return Ok(Some(response));
  }
  Ok(None)
}
