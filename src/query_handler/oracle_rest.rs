use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use regex::Regex;
use serde_json::{json, Map, Value};
use std::sync::LazyLock;
use tracing::debug;

use super::{bare_template, item_response, template, unshred_rows, Endpoint, QueryHandler, Target};
use crate::http::{Request, Response};
use crate::proxy::ProxyContext;
use crate::shred::ResourceType;
use crate::store::Selector;

/// Oracle REST collection queries: `?q=dept=10;name LIKE 'A%'&limit=5&offset=10`.
///
/// The result is annotated with `offset`, `hasMore`, `limit` (when given) and
/// `totalResults` (when `totalResults=true`).
#[derive(Debug, Clone)]
pub struct OracleRestQueryHandler {
  endpoint: Endpoint,
}

impl OracleRestQueryHandler {
  pub fn new(endpoint: &str) -> Result<Self> {
    Ok(Self {
      endpoint: Endpoint::parse(endpoint)?,
    })
  }
}

/// Paging and filter parameters of a collection request.
#[derive(Debug, Default, PartialEq)]
struct CollectionQuery {
  selector: Selector,
  limit: Option<usize>,
  offset: usize,
  total_results: bool,
}

impl CollectionQuery {
  fn from_request(request: &Request) -> Result<Self> {
    let mut query = CollectionQuery::default();
    for (name, value) in request.url.query_pairs() {
      match name.as_ref() {
        "q" => query.selector = parse_q(&value)?,
        "limit" => {
          query.limit = Some(
            value
              .parse()
              .map_err(|e| eyre!("Invalid limit '{}': {}", value, e))?,
          )
        }
        "offset" => {
          query.offset = value
            .parse()
            .map_err(|e| eyre!("Invalid offset '{}': {}", value, e))?
        }
        "totalResults" => query.total_results = value == "true",
        _ => {}
      }
    }
    Ok(query)
  }
}

/// One `field op value` clause of a `q` expression.
static Q_CONDITION: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| {
  Regex::new(r"(?i)^\s*([\w.]+)\s*(<=|>=|!=|<>|=|<|>|\s+like\s+)\s*(.+?)\s*$")
});

/// Translate a `q` expression into a selector.
fn parse_q(q: &str) -> Result<Selector> {
  let condition = Q_CONDITION
    .as_ref()
    .map_err(|e| eyre!("Failed to compile q parser: {}", e))?;

  let mut clauses = Vec::new();
  for part in split_outside_quotes(q, ';') {
    if part.trim().is_empty() {
      continue;
    }
    let caps = condition
      .captures(&part)
      .ok_or_else(|| eyre!("Unsupported q condition: {}", part))?;
    let field = &caps[1];
    let op = caps[2].trim().to_ascii_uppercase();
    let raw = &caps[3];

    let condition = match op.as_str() {
      "=" => literal(raw),
      "!=" | "<>" => json!({ "$ne": literal(raw) }),
      "<" => json!({ "$lt": literal(raw) }),
      "<=" => json!({ "$lte": literal(raw) }),
      ">" => json!({ "$gt": literal(raw) }),
      ">=" => json!({ "$gte": literal(raw) }),
      "LIKE" => json!({ "$regex": like_to_regex(&unquote(raw)) }),
      other => return Err(eyre!("Unsupported q operator: {}", other)),
    };

    let mut clause = Map::new();
    clause.insert(field.to_string(), condition);
    clauses.push(Selector::from_value(Value::Object(clause))?);
  }

  Ok(match clauses.len() {
    0 => Selector::all(),
    1 => clauses.remove(0),
    _ => Selector::and(clauses),
  })
}

fn split_outside_quotes(input: &str, separator: char) -> Vec<String> {
  let mut parts = Vec::new();
  let mut current = String::new();
  let mut quote: Option<char> = None;

  for c in input.chars() {
    match quote {
      Some(q) if c == q => {
        quote = None;
        current.push(c);
      }
      Some(_) => current.push(c),
      None if c == '\'' || c == '"' => {
        quote = Some(c);
        current.push(c);
      }
      None if c == separator => parts.push(std::mem::take(&mut current)),
      None => current.push(c),
    }
  }
  parts.push(current);
  parts
}

fn unquote(raw: &str) -> String {
  let raw = raw.trim();
  for q in ['\'', '"'] {
    if raw.len() >= 2 && raw.starts_with(q) && raw.ends_with(q) {
      return raw[1..raw.len() - 1].to_string();
    }
  }
  raw.to_string()
}

/// Quoted values are strings; bare values become numbers or booleans when
/// they parse as such.
fn literal(raw: &str) -> Value {
  let trimmed = raw.trim();
  if trimmed.starts_with('\'') || trimmed.starts_with('"') {
    return Value::String(unquote(trimmed));
  }
  serde_json::from_str::<Value>(trimmed)
    .ok()
    .filter(|v| v.is_number() || v.is_boolean())
    .unwrap_or_else(|| Value::String(trimmed.to_string()))
}

/// SQL LIKE pattern (`%`, `_`) to an anchored regex.
fn like_to_regex(pattern: &str) -> String {
  let mut regex = String::from("^");
  let mut literal = String::new();
  for c in pattern.chars() {
    match c {
      '%' | '_' => {
        regex.push_str(&regex::escape(&literal));
        literal.clear();
        regex.push_str(if c == '%' { ".*" } else { "." });
      }
      _ => literal.push(c),
    }
  }
  regex.push_str(&regex::escape(&literal));
  regex.push('$');
  regex
}

#[async_trait]
impl QueryHandler for OracleRestQueryHandler {
  async fn handle(&self, request: &Request, ctx: &ProxyContext) -> Result<Option<Response>> {
    let Some(target) = self.endpoint.target(request) else {
      return Ok(None);
    };
    let Some(processor) = ctx.json_processor.as_deref() else {
      return Ok(None);
    };

    let query = match target {
      Target::Item(key) => return item_response(request, &key, processor, ctx),
      Target::Collection => CollectionQuery::from_request(request)?,
    };

    let store = ctx.stores.open_store(processor.store_name())?;
    let rows = store.find(&query.selector)?;
    let template = match template(request, ctx)? {
      Some(template) => template,
      None if rows.is_empty() => return Ok(None),
      None => bare_template(request),
    };

    let total = rows.len();
    let page: Vec<_> = rows
      .into_iter()
      .skip(query.offset)
      .take(query.limit.unwrap_or(usize::MAX))
      .collect();
    let has_more = query
      .limit
      .is_some_and(|limit| query.offset.saturating_add(limit) < total);

    debug!(url = %request.url, total, returned = page.len(), has_more, "oracle rest query");

    let mut response = unshred_rows(processor, page, ResourceType::Collection, &template)?;
    if let Ok(Value::Object(mut body)) = response.json::<Value>() {
      body.insert("offset".to_string(), Value::from(query.offset));
      body.insert("hasMore".to_string(), Value::Bool(has_more));
      match query.limit {
        Some(limit) => body.insert("limit".to_string(), Value::from(limit)),
        None => body.remove("limit"),
      };
      if query.total_results {
        body.insert("totalResults".to_string(), Value::from(total));
      }
      response.body = serde_json::to_vec(&body)
        .map_err(|e| eyre!("Failed to serialize query result: {}", e))?
        .into();
    }
    Ok(Some(response))
  }
}
