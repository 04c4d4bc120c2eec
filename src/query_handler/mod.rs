//! Serve GET requests from shredded stores.
//!
//! A query handler answers a request for a resource endpoint (or one item
//! under it) by querying the store the endpoint was shredded into and
//! unshredding the matching rows. It declines with `Ok(None)` when it cannot
//! answer, and the caller falls back to a literal cache lookup.

mod oracle_rest;
mod simple;

pub use oracle_rest::OracleRestQueryHandler;
pub use simple::SimpleQueryHandler;

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use url::Url;

use crate::cache::MatchOptions;
use crate::http::{Request, Response};
use crate::proxy::ProxyContext;
use crate::shred::{JsonProcessor, ResourceType, ShreddedData};
use crate::store::StoreRow;

#[async_trait]
pub trait QueryHandler: Send + Sync {
  async fn handle(&self, request: &Request, ctx: &ProxyContext) -> Result<Option<Response>>;
}

/// What part of an endpoint a request addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Target {
  Collection,
  Item(String),
}

/// Collection URL a handler is responsible for.
#[derive(Debug, Clone)]
pub(crate) struct Endpoint {
  url: Url,
}

impl Endpoint {
  pub(crate) fn parse(endpoint: &str) -> Result<Self> {
    let mut url =
      Url::parse(endpoint).map_err(|e| eyre!("Invalid endpoint '{}': {}", endpoint, e))?;
    url.set_query(None);
    url.set_fragment(None);
    Ok(Self { url })
  }

  /// Resolve `request` against this endpoint, if it falls under it.
  pub(crate) fn target(&self, request: &Request) -> Option<Target> {
    if !request.method.is_cacheable() || request.url.origin() != self.url.origin() {
      return None;
    }

    let base = self.url.path().trim_end_matches('/');
    let path = request.url.path().trim_end_matches('/');
    if path == base {
      return Some(Target::Collection);
    }

    let rest = path.strip_prefix(base)?.strip_prefix('/')?;
    if rest.is_empty() || rest.contains('/') {
      return None;
    }
    Some(Target::Item(rest.to_string()))
  }
}

/// Response the rows are unshredded into: the cached snapshot of the
/// resource, or a bare JSON 200.
pub(crate) fn template(request: &Request, ctx: &ProxyContext) -> Result<Option<Response>> {
  ctx.cache.match_request(request, MatchOptions::ignore_search())
}

pub(crate) fn bare_template(request: &Request) -> Response {
  Response::new(200, "OK")
    .with_url(request.url.as_str())
    .with_header("Content-Type", "application/json")
}

/// Unshred `rows` as one resource type through `processor`.
pub(crate) fn unshred_rows(
  processor: &dyn JsonProcessor,
  rows: Vec<StoreRow>,
  resource_type: ResourceType,
  template: &Response,
) -> Result<Response> {
  let (keys, data): (Vec<_>, Vec<_>) = rows.into_iter().map(|r| (r.key, r.value)).unzip();
  let shredded = ShreddedData::new(processor.store_name(), None, keys, data, resource_type)
    .map_err(|e| eyre!("Failed to assemble query result: {}", e))?;
  processor
    .unshred(&[shredded], template)
    .map_err(|e| eyre!("Failed to unshred query result: {}", e))
}

/// Answer an item request with `find_by_key`.
pub(crate) fn item_response(
  request: &Request,
  key: &str,
  processor: &dyn JsonProcessor,
  ctx: &ProxyContext,
) -> Result<Option<Response>> {
  let store = ctx.stores.open_store(processor.store_name())?;
  let Some(value) = store.find_by_key(key)? else {
    return Ok(None);
  };

  let template = ctx
    .cache
    .match_request(request, MatchOptions::default())?
    .unwrap_or_else(|| bare_template(request));
  let row = StoreRow {
    key: key.to_string(),
    value,
  };
  unshred_rows(processor, vec![row], ResourceType::Single, &template).map(Some)
}
