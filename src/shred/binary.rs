use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::json;

use super::{rebuild, JsonProcessor, ResourceType, ShredError, ShreddedData};
use crate::http::Response;

/// Non-text payloads (images, files). The body is kept as one row keyed by
/// the response URL: `{ "contentType": ..., "data": <base64> }`.
#[derive(Debug, Clone)]
pub struct BinaryProcessor {
  store_name: String,
}

impl BinaryProcessor {
  pub fn new(store_name: &str) -> Self {
    Self {
      store_name: store_name.to_string(),
    }
  }
}

impl JsonProcessor for BinaryProcessor {
  fn store_name(&self) -> &str {
    &self.store_name
  }

  fn shred(&self, response: &Response) -> Result<Vec<ShreddedData>, ShredError> {
    if response.url.is_empty() {
      return Err(ShredError::MissingId("url".to_string()));
    }
    let row = json!({
      "contentType": response.headers.get("Content-Type"),
      "data": BASE64.encode(&response.body),
    });
    Ok(vec![ShreddedData::new(
      &self.store_name,
      response.headers.get("ETag").map(String::from),
      vec![response.url.clone()],
      vec![row],
      ResourceType::Single,
    )?])
  }

  fn unshred(&self, data: &[ShreddedData], response: &Response) -> Result<Response, ShredError> {
    let row = data
      .iter()
      .flat_map(|d| d.data.iter())
      .next()
      .ok_or_else(|| ShredError::Inconsistent("no binary row".to_string()))?;
    let encoded = row
      .get("data")
      .and_then(|d| d.as_str())
      .ok_or_else(|| ShredError::UnexpectedShape("binary row has no data".to_string()))?;
    let body = BASE64
      .decode(encoded)
      .map_err(|e| ShredError::UnexpectedShape(format!("invalid base64 payload: {}", e)))?;

    let mut rebuilt = rebuild(response, body);
    if let Some(content_type) = row.get("contentType").and_then(|c| c.as_str()) {
      rebuilt.headers.set("Content-Type", content_type);
    }
    Ok(rebuilt)
  }
}
