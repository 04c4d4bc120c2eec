use serde_json::{Map, Value};

use super::{
  all_rows, is_single, parse_body, rebuild, row_key, JsonProcessor, ResourceType, ShredError,
  ShreddedData,
};
use crate::http::Response;

/// Header carrying the execution context id of an Oracle REST response.
pub const ECID_HEADER: &str = "X-ORACLE-DMS-ECID";

/// Oracle REST payloads: collections arrive as `{ "items": [...], "count": n, ... }`.
#[derive(Debug, Clone)]
pub struct OracleRestJsonProcessor {
  store_name: String,
  id_attr: String,
}

impl OracleRestJsonProcessor {
  pub fn new(store_name: &str, id_attr: &str) -> Self {
    Self {
      store_name: store_name.to_string(),
      id_attr: id_attr.to_string(),
    }
  }
}

impl JsonProcessor for OracleRestJsonProcessor {
  fn store_name(&self) -> &str {
    &self.store_name
  }

  fn shred(&self, response: &Response) -> Result<Vec<ShreddedData>, ShredError> {
    let Some(body) = parse_body(response)? else {
      return Ok(Vec::new());
    };
    let ecid = response.headers.get(ECID_HEADER).map(String::from);

    let (rows, resource_type) = match body {
      Value::Object(mut map) => match map.remove("items") {
        Some(Value::Array(items)) => (items, ResourceType::Collection),
        Some(other) => {
          return Err(ShredError::UnexpectedShape(format!(
            "items must be an array, got {}",
            other
          )))
        }
        None => (vec![Value::Object(map)], ResourceType::Single),
      },
      other => {
        return Err(ShredError::UnexpectedShape(format!(
          "expected an object, got {}",
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
      ecid,
      keys,
      rows,
      resource_type,
    )?])
  }

  /// Collections keep the envelope of the template body (links, hasMore, ...)
  /// with `items` and `count` replaced.
  fn unshred(&self, data: &[ShreddedData], response: &Response) -> Result<Response, ShredError> {
    let rows = all_rows(data);
    let body = if is_single(data) {
      rows.into_iter().next().unwrap_or(Value::Null)
    } else {
      let mut envelope = match serde_json::from_slice::<Value>(&response.body) {
        Ok(Value::Object(map)) if map.contains_key("items") => map,
        _ => Map::new(),
      };
      envelope.insert("count".to_string(), Value::from(rows.len()));
      envelope.insert("items".to_string(), Value::Array(rows));
      Value::Object(envelope)
    };
    Ok(rebuild(response, serde_json::to_vec(&body)?))
  }
}
