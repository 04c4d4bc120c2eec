use async_trait::async_trait;
use color_eyre::Result;
use tracing::debug;

use super::{bare_template, item_response, template, unshred_rows, Endpoint, QueryHandler, Target};
use crate::http::{Request, Response};
use crate::proxy::ProxyContext;
use crate::shred::ResourceType;
use crate::store::Selector;

/// Treats every URL parameter as an equality filter: `?dept=10&active=true`.
#[derive(Debug, Clone)]
pub struct SimpleQueryHandler {
  endpoint: Endpoint,
  ignore_url_params: Vec<String>,
}

impl SimpleQueryHandler {
  pub fn new(endpoint: &str) -> Result<Self> {
    Ok(Self {
      endpoint: Endpoint::parse(endpoint)?,
      ignore_url_params: Vec::new(),
    })
  }

  /// Parameters that are not filters (cache busters, auth tokens, ...).
  pub fn ignoring(mut self, params: Vec<String>) -> Self {
    self.ignore_url_params = params;
    self
  }

  fn selector(&self, request: &Request) -> Selector {
    request
      .url
      .query_pairs()
      .filter(|(name, _)| !self.ignore_url_params.iter().any(|p| p == name))
      .fold(Selector::all(), |selector, (name, value)| {
        selector.eq(&name, value.into_owned())
      })
  }
}

#[async_trait]
impl QueryHandler for SimpleQueryHandler {
  async fn handle(&self, request: &Request, ctx: &ProxyContext) -> Result<Option<Response>> {
    let Some(target) = self.endpoint.target(request) else {
      return Ok(None);
    };
    let Some(processor) = ctx.json_processor.as_deref() else {
      return Ok(None);
    };

    match target {
      Target::Item(key) => item_response(request, &key, processor, ctx),
      Target::Collection => {
        let store = ctx.stores.open_store(processor.store_name())?;
        let rows = store.find(&self.selector(request))?;
        let template = match template(request, ctx)? {
          Some(template) => template,
          None if rows.is_empty() => return Ok(None),
          None => bare_template(request),
        };

        debug!(url = %request.url, rows = rows.len(), "simple query");
        unshred_rows(processor, rows, ResourceType::Collection, &template).map(Some)
      }
    }
  }
}
