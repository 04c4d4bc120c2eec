//! Shredding turns a response body into rows for a named store; unshredding
//! rebuilds a response body from rows.
//!
//! Three processors ship with the crate:
//! - [`SimpleJsonProcessor`] - a top-level array is a collection, an object a single row
//! - [`OracleRestJsonProcessor`] - collections are wrapped as `{ "items": [...], "count": n }`
//! - [`BinaryProcessor`] - the whole body is one base64 row keyed by URL

mod binary;
mod oracle_rest;
mod simple_json;

pub use binary::BinaryProcessor;
pub use oracle_rest::OracleRestJsonProcessor;
pub use simple_json::SimpleJsonProcessor;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::http::{Response, CACHE_EXPIRATION_HEADER};
use crate::store::{lookup, scalar_text, StoreRow};

#[derive(Debug, Error)]
pub enum ShredError {
  #[error("response body is not valid JSON: {0}")]
  InvalidJson(#[from] serde_json::Error),
  #[error("row has no usable id attribute '{0}'")]
  MissingId(String),
  #[error("unexpected payload shape: {0}")]
  UnexpectedShape(String),
  #[error("inconsistent shredded data: {0}")]
  Inconsistent(String),
}

/// Whether shredded rows came from a single resource or a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
  Single,
  Collection,
}

/// Rows extracted from one response, destined for one store.
#[derive(Debug, Clone, PartialEq)]
pub struct ShreddedData {
  /// Store the rows belong to
  pub name: String,
  /// Version tag of the resource (ETag, ECID, ...)
  pub resource_identifier: Option<String>,
  pub keys: Vec<String>,
  pub data: Vec<Value>,
  pub resource_type: ResourceType,
}

impl ShreddedData {
  /// Build shredded data, checking that keys and rows line up.
  pub fn new(
    name: &str,
    resource_identifier: Option<String>,
    keys: Vec<String>,
    data: Vec<Value>,
    resource_type: ResourceType,
  ) -> Result<Self, ShredError> {
    if keys.len() != data.len() {
      return Err(ShredError::Inconsistent(format!(
        "{} keys for {} rows",
        keys.len(),
        data.len()
      )));
    }
    if resource_type == ResourceType::Single && keys.len() != 1 {
      return Err(ShredError::Inconsistent(format!(
        "single resource with {} rows",
        keys.len()
      )));
    }
    Ok(Self {
      name: name.to_string(),
      resource_identifier,
      keys,
      data,
      resource_type,
    })
  }

  pub fn rows(&self) -> Vec<StoreRow> {
    self
      .keys
      .iter()
      .zip(&self.data)
      .map(|(key, value)| StoreRow {
        key: key.clone(),
        value: value.clone(),
      })
      .collect()
  }
}

/// A shredder/unshredder pair for one payload format.
pub trait JsonProcessor: Send + Sync {
  /// Name of the store rows are written to.
  fn store_name(&self) -> &str;

  fn shred(&self, response: &Response) -> Result<Vec<ShreddedData>, ShredError>;

  /// Build a response from `data`, using `response` for status and headers.
  /// The freshness stamp of the template is dropped.
  fn unshred(&self, data: &[ShreddedData], response: &Response) -> Result<Response, ShredError>;
}

/// Shred `response`, degrading to no rows when the body is malformed.
pub fn shred_or_empty(processor: &dyn JsonProcessor, response: &Response) -> Vec<ShreddedData> {
  match processor.shred(response) {
    Ok(data) => data,
    Err(e) => {
      warn!(url = %response.url, store = processor.store_name(), "Skipping shredding: {}", e);
      Vec::new()
    }
  }
}

/// Key of `row` taken from `id_attr` (a dot path).
pub(crate) fn row_key(row: &Value, id_attr: &str) -> Result<String, ShredError> {
  lookup(row, id_attr)
    .and_then(scalar_text)
    .ok_or_else(|| ShredError::MissingId(id_attr.to_string()))
}

/// Parse a JSON body. An empty body yields `None`.
pub(crate) fn parse_body(response: &Response) -> Result<Option<Value>, ShredError> {
  if response.body.iter().all(u8::is_ascii_whitespace) {
    return Ok(None);
  }
  Ok(Some(serde_json::from_slice(&response.body)?))
}

/// Copy `template` with a new body, marked as rehydrated from local data.
pub(crate) fn rebuild(template: &Response, body: impl Into<Bytes>) -> Response {
  let mut response = template.clone();
  response.body = body.into();
  response.headers.remove(CACHE_EXPIRATION_HEADER);
  response.headers.remove("Content-Length");
  response.is_cached = true;
  response
}

/// Rows of every shredded block, flattened in order.
pub(crate) fn all_rows(data: &[ShreddedData]) -> Vec<Value> {
  data.iter().flat_map(|d| d.data.iter().cloned()).collect()
}

pub(crate) fn is_single(data: &[ShreddedData]) -> bool {
  data
    .first()
    .is_some_and(|d| d.resource_type == ResourceType::Single)
}
