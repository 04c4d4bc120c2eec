use serde_json::Value;

use super::{
  all_rows, is_single, parse_body, rebuild, row_key, JsonProcessor, ResourceType, ShredError,
  ShreddedData,
};
use crate::http::Response;

/// Plain JSON payloads: an array is a collection, an object is one row.
#[derive(Debug, Clone)]
pub struct SimpleJsonProcessor {
  store_name: String,
  id_attr: String,
}

impl SimpleJsonProcessor {
  pub fn new(store_name: &str, id_attr: &str) -> Self {
    Self {
      store_name: store_name.to_string(),
      id_attr: id_attr.to_string(),
    }
  }
}

impl JsonProcessor for SimpleJsonProcessor {
  fn store_name(&self) -> &str {
    &self.store_name
  }

  fn shred(&self, response: &Response) -> Result<Vec<ShreddedData>, ShredError> {
    let Some(body) = parse_body(response)? else {
      return Ok(Vec::new());
    };
    let etag = response.headers.get("ETag").map(String::from);

    let (rows, resource_type) = match body {
      Value::Array(items) => (items, ResourceType::Collection),
      row @ Value::Object(_) => (vec![row], ResourceType::Single),
      other => {
        return Err(ShredError::UnexpectedShape(format!(
          "expected array or object, got {}",
          other
        )))
      }
    };

    let keys = rows
      .iter()
      .map(|row| row_key(row, &self.id_attr))
      .collect::<Result<Vec<_>, _>>()?;

    Ok(vec![ShreddedData::new(
      &self.store_name,
      etag,
      keys,
      rows,
      resource_type,
    )?])
  }

  fn unshred(&self, data: &[ShreddedData], response: &Response) -> Result<Response, ShredError> {
    let rows = all_rows(data);
    let body = if is_single(data) {
      rows.into_iter().next().unwrap_or(Value::Null)
    } else {
      Value::Array(rows)
    };
    Ok(rebuild(response, serde_json::to_vec(&body)?))
  }
}
