//! The default response proxy: routes each request through the fetch
//! strategy or a method handler, post-processes the result, and queues
//! mutations the server has not seen.

mod context;
mod handlers;

pub use context::ProxyContext;
pub use handlers::{offline_not_supported, RequestHandlerOverride};

use color_eyre::Result;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::cache::ResponseCache;
use crate::db::Database;
use crate::http::{Connectivity, Method, Request, Response, Transport};
use crate::query_handler::QueryHandler;
use crate::shred::JsonProcessor;
use crate::store::StoreManager;
use crate::strategy::{CacheIfOfflineStrategy, CacheStrategy, FetchStrategy, HttpCacheStrategy};
use crate::sync::{SyncLog, SyncManager};
use handlers::{handle_get, handle_pass_through, handle_put_or_delete, run_override, Handled};

/// Entry point for requests that should survive going offline.
pub struct DefaultResponseProxy {
  ctx: Arc<ProxyContext>,
  fetch_strategy: Arc<dyn FetchStrategy>,
  request_handler_override: Option<Arc<dyn RequestHandlerOverride>>,
  sync_manager: Arc<dyn SyncManager>,
}

impl DefaultResponseProxy {
  pub fn builder(
    db: Arc<Database>,
    transport: Arc<dyn Transport>,
    connectivity: Arc<dyn Connectivity>,
  ) -> ProxyBuilder {
    ProxyBuilder {
      db,
      transport,
      connectivity,
      fetch_strategy: None,
      cache_strategy: None,
      json_processor: None,
      query_handler: None,
      request_handler_override: None,
      sync_manager: None,
    }
  }

  pub fn context(&self) -> &Arc<ProxyContext> {
    &self.ctx
  }

  /// Answer `request`.
  ///
  /// Connectivity problems and server errors come back as responses
  /// (503/504/412 when synthesized). An `Err` means the pipeline itself
  /// failed; a mutating request is still queued for sync before the error is
  /// returned.
  pub async fn process_request(&self, request: &Request) -> Result<Response> {
    match self.run(request).await {
      Ok(response) => Ok(response),
      Err(e) => {
        if request.method.is_mutating() {
          if let Err(sync_err) = self.sync_manager.insert_request(request, &[]).await {
            error!(url = %request.url, "Failed to queue request after error: {}", sync_err);
          }
        }
        Err(e)
      }
    }
  }

  async fn run(&self, request: &Request) -> Result<Response> {
    let Handled { response, deferred } = self.dispatch(request).await?;
    let (response, undo_redo) = self.ctx.process_server_response(request, response).await?;

    if request.method.is_mutating() && response.ok() && deferred {
      self.sync_manager.insert_request(request, &undo_redo).await?;
    }
    Ok(response)
  }

  async fn dispatch(&self, request: &Request) -> Result<Handled> {
    if let Some(handler) = &self.request_handler_override {
      if let Some(response) = run_override(handler.as_ref(), request).await? {
        debug!(method = %request.method, url = %request.url, "served by request handler override");
        return Ok(Handled {
          response,
          deferred: !self.ctx.is_online(),
        });
      }
    }

    debug!(method = %request.method, url = %request.url, "default handler");
    match request.method {
      Method::Get | Method::Head => {
        handle_get(request, &self.ctx, self.fetch_strategy.as_ref()).await
      }
      Method::Post | Method::Patch | Method::Options => {
        handle_pass_through(request, &self.ctx).await
      }
      Method::Put | Method::Delete => handle_put_or_delete(request, &self.ctx).await,
    }
  }
}

/// Assembles a [`DefaultResponseProxy`]. Unset plugins fall back to
/// Cache-If-Offline, HTTP cache-control, no shredding, no query handler and a
/// [`SyncLog`] in the same database.
pub struct ProxyBuilder {
  db: Arc<Database>,
  transport: Arc<dyn Transport>,
  connectivity: Arc<dyn Connectivity>,
  fetch_strategy: Option<Arc<dyn FetchStrategy>>,
  cache_strategy: Option<Arc<dyn CacheStrategy>>,
  json_processor: Option<Arc<dyn JsonProcessor>>,
  query_handler: Option<Arc<dyn QueryHandler>>,
  request_handler_override: Option<Arc<dyn RequestHandlerOverride>>,
  sync_manager: Option<Arc<dyn SyncManager>>,
}

impl ProxyBuilder {
  pub fn fetch_strategy(mut self, strategy: Arc<dyn FetchStrategy>) -> Self {
    self.fetch_strategy = Some(strategy);
    self
  }

  pub fn cache_strategy(mut self, strategy: Arc<dyn CacheStrategy>) -> Self {
    self.cache_strategy = Some(strategy);
    self
  }

  pub fn json_processor(mut self, processor: Arc<dyn JsonProcessor>) -> Self {
    self.json_processor = Some(processor);
    self
  }

  pub fn query_handler(mut self, handler: Arc<dyn QueryHandler>) -> Self {
    self.query_handler = Some(handler);
    self
  }

  pub fn request_handler_override(mut self, handler: Arc<dyn RequestHandlerOverride>) -> Self {
    self.request_handler_override = Some(handler);
    self
  }

  pub fn sync_manager(mut self, manager: Arc<dyn SyncManager>) -> Self {
    self.sync_manager = Some(manager);
    self
  }

  pub fn build(self) -> DefaultResponseProxy {
    let sync_manager = self
      .sync_manager
      .unwrap_or_else(|| Arc::new(SyncLog::new(Arc::clone(&self.db))));

    let ctx = ProxyContext {
      transport: self.transport,
      connectivity: self.connectivity,
      cache: ResponseCache::new(Arc::clone(&self.db)),
      stores: StoreManager::new(Arc::clone(&self.db)),
      cache_strategy: self
        .cache_strategy
        .unwrap_or_else(|| Arc::new(HttpCacheStrategy)),
      json_processor: self.json_processor,
      query_handler: self.query_handler,
    };

    info!(
      shredding = ctx.json_processor.is_some(),
      query_handler = ctx.query_handler.is_some(),
      "response proxy ready"
    );

    DefaultResponseProxy {
      ctx: Arc::new(ctx),
      fetch_strategy: self
        .fetch_strategy
        .unwrap_or_else(|| Arc::new(CacheIfOfflineStrategy)),
      request_handler_override: self.request_handler_override,
      sync_manager,
    }
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::cache::MatchOptions;
  use crate::http::{OnlineFlag, CACHE_EXPIRATION_HEADER};
  use crate::query_handler::OracleRestQueryHandler;
  use crate::shred::{BinaryProcessor, OracleRestJsonProcessor};
  use crate::strategy::CacheFirstStrategy;
  use crate::sync::{StoreOperation, UndoRedoData, UndoRedoEntry};
  use crate::test_support::MockTransport;
  use async_trait::async_trait;
  use color_eyre::eyre::eyre;
  use serde_json::{json, Value};
  use std::time::Duration;
  use tokio::sync::mpsc;

  /// Context over a fresh in-memory database.
  pub(crate) fn context(
    transport: Arc<dyn Transport>,
    online: Arc<OnlineFlag>,
    processor: Option<Arc<dyn JsonProcessor>>,
    query_handler: Option<Arc<dyn QueryHandler>>,
  ) -> Arc<ProxyContext> {
    let db = Arc::new(Database::open_in_memory().unwrap());
    Arc::new(ProxyContext {
      transport,
      connectivity: online,
      cache: ResponseCache::new(Arc::clone(&db)),
      stores: StoreManager::new(db),
      cache_strategy: Arc::new(HttpCacheStrategy),
      json_processor: processor,
      query_handler,
    })
  }

  const ITEMS: &str = "https://example.com/items";

  struct Harness {
    proxy: DefaultResponseProxy,
    transport: Arc<MockTransport>,
    online: Arc<OnlineFlag>,
    sync_log: SyncLog,
  }

  fn harness() -> Harness {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let transport = Arc::new(MockTransport::new());
    let online = Arc::new(OnlineFlag::new(true));
    let proxy = DefaultResponseProxy::builder(Arc::clone(&db), transport.clone(), online.clone())
      .json_processor(Arc::new(OracleRestJsonProcessor::new("items", "id")))
      .query_handler(Arc::new(OracleRestQueryHandler::new(ITEMS).unwrap()))
      .build();
    Harness {
      proxy,
      transport,
      online,
      sync_log: SyncLog::new(db),
    }
  }

  fn request(method: Method, url: &str) -> Request {
    Request::parse(method, url).unwrap()
  }

  fn row(id: i64) -> Value {
    json!({"id": id, "name": format!("item {}", id)})
  }

  fn collection(ids: &[i64]) -> Response {
    let items: Vec<Value> = ids.iter().map(|&id| row(id)).collect();
    Response::synthetic(
      200,
      "OK",
      serde_json::to_vec(&json!({"items": items, "count": ids.len()})).unwrap(),
    )
    .with_header("Content-Type", "application/json")
  }

  fn store_keys(proxy: &DefaultResponseProxy, name: &str) -> Vec<String> {
    proxy.context().stores.open_store(name).unwrap().keys().unwrap()
  }

  #[tokio::test]
  async fn test_offline_paging_and_delete_scenario() {
    let h = harness();
    h.transport.respond(
      ITEMS,
      Response::synthetic(
        200,
        "OK",
        serde_json::to_vec(&json!({"items": [row(1), row(2), row(3)], "count": 3})).unwrap(),
      )
      .with_header("Cache-Control", "max-age=60")
      .with_header("Content-Type", "application/json"),
    );

    let live = h.proxy.process_request(&request(Method::Get, ITEMS)).await.unwrap();
    assert_eq!(live.status, 200);
    assert!(live.headers.contains(CACHE_EXPIRATION_HEADER));
    assert!(h
      .proxy
      .context()
      .cache
      .has_match(&request(Method::Get, ITEMS), MatchOptions::default())
      .unwrap());

    h.online.set_online(false);
    let page = h
      .proxy
      .process_request(&request(Method::Get, "https://example.com/items?limit=1&offset=1"))
      .await
      .unwrap();
    let body: Value = page.json().unwrap();
    assert_eq!(body["items"], json!([row(2)]));
    assert_eq!(body["hasMore"], json!(true));
    assert!(page.is_cached);

    let deleted = h
      .proxy
      .process_request(&request(Method::Delete, "https://example.com/items/2"))
      .await
      .unwrap();
    assert_eq!(deleted.status, 200);
    assert_eq!(deleted.json::<Value>().unwrap(), row(2));

    let entries = h.sync_log.entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].request.method, Method::Delete);
    assert_eq!(
      entries[0].undo_redo,
      vec![UndoRedoData {
        store_name: "items".to_string(),
        operation: StoreOperation::Remove,
        undo_redo_data: vec![UndoRedoEntry {
          key: "2".to_string(),
          undo: Some(row(2)),
          redo: None,
        }],
      }]
    );

    let store = h.proxy.context().stores.open_store("items").unwrap();
    assert_eq!(store.keys().unwrap(), vec!["1", "3"]);
    assert_eq!(h.transport.request_count(), 1);
  }

  #[tokio::test]
  async fn test_offline_put_echoes_body_with_new_etag() {
    let h = harness();
    h.online.set_online(false);
    let put = request(Method::Put, "https://example.com/items/7")
      .with_header("If-Match", "\"v1\"")
      .with_json(&row(7))
      .unwrap();

    let response = h.proxy.process_request(&put).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, put.body);
    let etag = response.headers.get("ETag").unwrap();
    assert_ne!(etag, "\"v1\"");
    assert!(!response.headers.contains("If-Match"));
    assert_eq!(h.transport.request_count(), 0);

    let entries = h.sync_log.entries().unwrap();
    assert_eq!(entries.len(), 1);
    let record = &entries[0].undo_redo[0];
    assert_eq!(record.operation, StoreOperation::Upsert);
    assert_eq!(record.undo_redo_data[0].undo, None);
    assert_eq!(record.undo_redo_data[0].redo, Some(row(7)));
  }

  #[tokio::test]
  async fn test_put_falls_back_on_server_error() {
    let h = harness();
    let url = "https://example.com/items/1";
    h.transport.respond(url, Response::new(503, "Service Unavailable"));
    h.transport.respond(url, Response::synthetic(200, "OK", serde_json::to_vec(&row(1)).unwrap()));
    let put = request(Method::Put, url).with_json(&row(1)).unwrap();

    let response = h.proxy.process_request(&put).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(h.sync_log.len().unwrap(), 1);

    let response = h.proxy.process_request(&put).await.unwrap();
    assert_eq!(response.status, 200);
    assert!(!response.is_cached);
    assert_eq!(h.sync_log.len().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_put_client_error_is_returned() {
    let h = harness();
    let url = "https://example.com/items/1";
    h.transport.respond(url, Response::new(409, "Conflict"));

    let response = h
      .proxy
      .process_request(&request(Method::Put, url).with_json(&row(1)).unwrap())
      .await
      .unwrap();
    assert_eq!(response.status, 409);
    assert!(h.sync_log.is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_post_requires_override_offline() {
    let h = harness();
    h.online.set_online(false);

    let response = h
      .proxy
      .process_request(&request(Method::Post, ITEMS).with_json(&row(9)).unwrap())
      .await
      .unwrap();
    assert_eq!(response.status, 503);
    assert_eq!(response.status_text, "Must provide override for offline");
    assert!(h.sync_log.is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_post_online_passes_through_and_shreds() {
    let h = harness();
    h.transport.respond(
      ITEMS,
      Response::synthetic(201, "Created", serde_json::to_vec(&row(9)).unwrap()),
    );

    let response = h
      .proxy
      .process_request(&request(Method::Post, ITEMS).with_json(&row(9)).unwrap())
      .await
      .unwrap();
    assert_eq!(response.status, 201);
    assert!(h.sync_log.is_empty().unwrap());
    let store = h.proxy.context().stores.open_store("items").unwrap();
    assert_eq!(store.find_by_key("9").unwrap(), Some(row(9)));
  }

  #[tokio::test]
  async fn test_cache_round_trip_and_no_store() {
    let h = harness();
    let cached = "https://example.com/items/1";
    let uncached = "https://example.com/items/2";
    h.transport.respond(
      cached,
      Response::synthetic(200, "OK", serde_json::to_vec(&row(1)).unwrap()),
    );
    h.transport.respond(
      uncached,
      Response::synthetic(200, "OK", serde_json::to_vec(&row(2)).unwrap())
        .with_header("Cache-Control", "no-store"),
    );

    for url in [cached, uncached] {
      h.proxy.process_request(&request(Method::Get, url)).await.unwrap();
    }

    let cache = &h.proxy.context().cache;
    let hit = cache
      .match_request(&request(Method::Get, cached), MatchOptions::default())
      .unwrap()
      .unwrap();
    assert_eq!(hit.status, 200);
    assert_eq!(hit.json::<Value>().unwrap(), row(1));
    assert!(!cache
      .has_match(&request(Method::Get, uncached), MatchOptions::default())
      .unwrap());
  }

  #[tokio::test]
  async fn test_offline_get_without_cache_is_503() {
    let h = harness();
    h.online.set_online(false);

    let response = h
      .proxy
      .process_request(&request(Method::Get, "https://example.com/other"))
      .await
      .unwrap();
    assert_eq!(response.status, 503);
    assert_eq!(h.transport.request_count(), 0);
  }

  #[tokio::test]
  async fn test_cache_first_refreshes_in_background() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let transport = Arc::new(MockTransport::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let strategy = CacheFirstStrategy::new().with_server_response_callback(Arc::new(
      move |_: &Request, response: &Response| {
        let _ = tx.send(response.clone());
      },
    ));
    let proxy = DefaultResponseProxy::builder(
      db,
      transport.clone(),
      Arc::new(OnlineFlag::new(true)),
    )
    .fetch_strategy(Arc::new(strategy))
    .json_processor(Arc::new(OracleRestJsonProcessor::new("items", "id")))
    .build();
    transport.respond(ITEMS, collection(&[1, 2]));
    transport.respond(ITEMS, collection(&[1, 2, 3]));

    let first = proxy.process_request(&request(Method::Get, ITEMS)).await.unwrap();
    assert!(!first.is_cached);
    assert_eq!(store_keys(&proxy, "items"), vec!["1", "2"]);
    assert!(proxy
      .context()
      .cache
      .has_match(&request(Method::Get, ITEMS), MatchOptions::default())
      .unwrap());
    let _ = rx.recv().await.unwrap();

    let second = proxy.process_request(&request(Method::Get, ITEMS)).await.unwrap();
    assert!(second.is_cached);
    assert_eq!(second.json::<Value>().unwrap()["count"], json!(2));

    let refreshed = tokio::time::timeout(Duration::from_secs(5), rx.recv())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(refreshed.json::<Value>().unwrap()["count"], json!(3));
    assert_eq!(store_keys(&proxy, "items"), vec!["1", "2", "3"]);
    let entry = proxy
      .context()
      .cache
      .match_request(&request(Method::Get, ITEMS), MatchOptions::default())
      .unwrap()
      .unwrap();
    assert_eq!(entry.json::<Value>().unwrap()["count"], json!(3));
    assert_eq!(transport.request_count(), 2);
  }

  #[tokio::test]
  async fn test_malformed_body_reaches_caller_unshredded() {
    let h = harness();
    let url = "https://example.com/items/5";
    h.transport.respond(
      url,
      Response::synthetic(200, "OK", "{\"id\": 5,").with_header("Content-Type", "application/json"),
    );

    let response = h.proxy.process_request(&request(Method::Get, url)).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "{\"id\": 5,");
    assert!(store_keys(&h.proxy, "items").is_empty());
    assert!(h.sync_log.is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_delete_falls_back_on_server_error() {
    let h = harness();
    let url = "https://example.com/items/2";
    h.transport.respond(ITEMS, collection(&[1, 2, 3]));
    h.transport.respond(url, Response::new(500, "Internal Server Error"));
    h.proxy.process_request(&request(Method::Get, ITEMS)).await.unwrap();

    let response = h.proxy.process_request(&request(Method::Delete, url)).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.json::<Value>().unwrap(), row(2));
    assert_eq!(store_keys(&h.proxy, "items"), vec!["1", "3"]);

    let entries = h.sync_log.entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].request.method, Method::Delete);
    assert_eq!(entries[0].undo_redo[0].operation, StoreOperation::Remove);
    assert_eq!(h.transport.request_count(), 2);
  }

  #[tokio::test]
  async fn test_offline_binary_delete_returns_stored_bytes() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let transport = Arc::new(MockTransport::new());
    let online = Arc::new(OnlineFlag::new(true));
    let proxy = DefaultResponseProxy::builder(Arc::clone(&db), transport.clone(), online.clone())
      .json_processor(Arc::new(BinaryProcessor::new("images")))
      .build();
    let url = "https://example.com/logo.png";
    let png = vec![0x89u8, b'P', b'N', b'G'];
    transport.respond(
      url,
      Response::synthetic(200, "OK", png.clone()).with_header("Content-Type", "image/png"),
    );

    proxy.process_request(&request(Method::Get, url)).await.unwrap();
    assert_eq!(store_keys(&proxy, "images"), vec![url]);

    online.set_online(false);
    let deleted = proxy.process_request(&request(Method::Delete, url)).await.unwrap();
    assert_eq!(deleted.status, 200);
    assert_eq!(deleted.body.as_ref(), png.as_slice());
    assert_eq!(deleted.headers.get("Content-Type"), Some("image/png"));
    assert!(store_keys(&proxy, "images").is_empty());
    assert_eq!(SyncLog::new(db).len().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_head_goes_through_cache() {
    let h = harness();
    let url = "https://example.com/other";
    h.transport.respond(
      url,
      Response::new(200, "OK")
        .with_header("ETag", "\"v1\"")
        .with_header("Content-Type", "text/plain"),
    );

    let live = h.proxy.process_request(&request(Method::Head, url)).await.unwrap();
    assert!(!live.is_cached);
    assert!(h
      .proxy
      .context()
      .cache
      .has_match(&request(Method::Head, url), MatchOptions::default())
      .unwrap());

    h.online.set_online(false);
    let local = h.proxy.process_request(&request(Method::Head, url)).await.unwrap();
    assert_eq!(local.status, 200);
    assert!(local.is_cached);
    assert_eq!(local.headers.get("ETag"), Some("\"v1\""));

    let get = h.proxy.process_request(&request(Method::Get, url)).await.unwrap();
    assert_eq!(get.status, 503);
    assert_eq!(h.transport.request_count(), 1);
  }

  struct FailingPost;

  #[async_trait]
  impl RequestHandlerOverride for FailingPost {
    async fn handle_post(&self, _request: &Request) -> Result<Option<Response>> {
      Err(eyre!("override exploded"))
    }

    async fn handle_patch(&self, request: &Request) -> Result<Option<Response>> {
      Ok(Some(Response::synthetic(200, "OK", request.body.clone())))
    }
  }

  #[tokio::test]
  async fn test_override_results_and_failures() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let online = Arc::new(OnlineFlag::new(false));
    let proxy =
      DefaultResponseProxy::builder(Arc::clone(&db), Arc::new(MockTransport::new()), online)
        .request_handler_override(Arc::new(FailingPost))
        .build();
    let sync_log = SyncLog::new(db);

    let err = proxy
      .process_request(&request(Method::Post, ITEMS).with_body("{}"))
      .await
      .unwrap_err();
    assert!(err.to_string().contains("override exploded"));
    let entries = sync_log.entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].undo_redo.is_empty());

    let patched = proxy
      .process_request(&request(Method::Patch, ITEMS).with_body("{\"a\":1}"))
      .await
      .unwrap();
    assert_eq!(patched.text(), "{\"a\":1}");
    assert_eq!(sync_log.len().unwrap(), 2);
  }
}
