//! Shared state every pipeline stage works against.

use color_eyre::Result;
use std::sync::Arc;
use tracing::debug;

use crate::cache::ResponseCache;
use crate::http::{Connectivity, Method, Request, Response, Transport};
use crate::query_handler::QueryHandler;
use crate::shred::{shred_or_empty, JsonProcessor, ShreddedData};
use crate::store::StoreManager;
use crate::strategy::CacheStrategy;
use crate::sync::{StoreOperation, UndoRedoData, UndoRedoEntry};

/// Collaborators of one proxy, shared with its strategies and background
/// fetches.
pub struct ProxyContext {
  pub transport: Arc<dyn Transport>,
  pub connectivity: Arc<dyn Connectivity>,
  pub cache: ResponseCache,
  pub stores: StoreManager,
  pub cache_strategy: Arc<dyn CacheStrategy>,
  pub json_processor: Option<Arc<dyn JsonProcessor>>,
  pub query_handler: Option<Arc<dyn QueryHandler>>,
}

impl ProxyContext {
  pub fn is_online(&self) -> bool {
    self.connectivity.is_online()
  }

  pub async fn network_fetch(&self, request: &Request) -> Result<Response> {
    debug!(method = %request.method, url = %request.url, "network fetch");
    self.transport.send(request).await
  }

  /// Post-process a successful response: cache-control for GET/HEAD, then
  /// shredding of anything that did not come from local data.
  ///
  /// Returns the response to hand to the caller and the undo/redo records of
  /// the rows that were written.
  pub async fn process_server_response(
    &self,
    request: &Request,
    response: Response,
  ) -> Result<(Response, Vec<UndoRedoData>)> {
    if !response.ok() {
      return Ok((response, Vec::new()));
    }

    let response = if request.method.is_cacheable() {
      self.cache_strategy.apply(request, response, self).await?
    } else {
      response
    };

    if !response.ok() || response.is_cached {
      return Ok((response, Vec::new()));
    }

    let undo_redo = self.shred_into_store(request, &response)?;
    Ok((response, undo_redo))
  }

  /// Write the rows of `response` into their stores, recording each row's
  /// value before and after.
  ///
  /// DELETE removes the shredded keys. When its body yields no rows, the row
  /// named by the last URL path segment is removed instead.
  pub fn shred_into_store(
    &self,
    request: &Request,
    response: &Response,
  ) -> Result<Vec<UndoRedoData>> {
    let Some(processor) = self.json_processor.as_deref() else {
      return Ok(Vec::new());
    };
    let shredded = shred_or_empty(processor, response);

    if request.method != Method::Delete {
      return shredded
        .iter()
        .filter(|data| !data.keys.is_empty())
        .map(|data| self.upsert_rows(data))
        .collect();
    }

    let mut targets: Vec<(String, Vec<String>)> = shredded
      .into_iter()
      .filter(|data| !data.keys.is_empty())
      .map(|data| (data.name, data.keys))
      .collect();
    if targets.is_empty() {
      if let Some(key) = request.last_path_segment() {
        targets.push((processor.store_name().to_string(), vec![key]));
      }
    }

    targets
      .iter()
      .map(|(store_name, keys)| self.remove_rows(store_name, keys))
      .collect()
  }

  fn upsert_rows(&self, data: &ShreddedData) -> Result<UndoRedoData> {
    let store = self.stores.open_store(&data.name)?;
    let rows = data.rows();

    let undo_redo_data = rows
      .iter()
      .map(|row| {
        Ok(UndoRedoEntry {
          key: row.key.clone(),
          undo: store.find_by_key(&row.key)?,
          redo: Some(row.value.clone()),
        })
      })
      .collect::<Result<Vec<_>>>()?;
    store.upsert_all(&rows)?;

    debug!(store = %data.name, rows = rows.len(), "shredded response into store");
    Ok(UndoRedoData {
      store_name: data.name.clone(),
      operation: StoreOperation::Upsert,
      undo_redo_data,
    })
  }

  fn remove_rows(&self, store_name: &str, keys: &[String]) -> Result<UndoRedoData> {
    let store = self.stores.open_store(store_name)?;

    let mut undo_redo_data = Vec::with_capacity(keys.len());
    for key in keys {
      let undo = store.find_by_key(key)?;
      store.remove_by_key(key)?;
      undo_redo_data.push(UndoRedoEntry {
        key: key.clone(),
        undo,
        redo: None,
      });
    }

    debug!(store = store_name, rows = keys.len(), "removed rows from store");
    Ok(UndoRedoData {
      store_name: store_name.to_string(),
      operation: StoreOperation::Remove,
      undo_redo_data,
    })
  }
}
