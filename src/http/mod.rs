//! Request/response descriptors shared by every layer of the proxy.
//!
//! Bodies are fully buffered (`Bytes`), so cloning a request or response is
//! cheap and a response can be handed to the caller, the cache and the
//! shredder without re-reading a stream.

mod transport;

pub use transport::{Connectivity, OnlineFlag, ReqwestTransport, Transport};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

/// Response header carrying the computed freshness of a cached response.
pub const CACHE_EXPIRATION_HEADER: &str = "x-oracle-jscpt-cache-expiration-date";

/// HTTP methods understood by the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
  Options,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Head => "HEAD",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
      Method::Options => "OPTIONS",
    }
  }

  /// GET and HEAD are the only methods whose responses may be cached.
  pub fn is_cacheable(&self) -> bool {
    matches!(self, Method::Get | Method::Head)
  }

  /// Methods that change server state and are recorded in the sync log.
  pub fn is_mutating(&self) -> bool {
    matches!(
      self,
      Method::Post | Method::Put | Method::Patch | Method::Delete
    )
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Method {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(Method::Get),
      "HEAD" => Ok(Method::Head),
      "POST" => Ok(Method::Post),
      "PUT" => Ok(Method::Put),
      "PATCH" => Ok(Method::Patch),
      "DELETE" => Ok(Method::Delete),
      "OPTIONS" => Ok(Method::Options),
      other => Err(eyre!("Unsupported HTTP method: {}", other)),
    }
  }
}

/// Credentials mode of a request, mirroring the fetch API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Credentials {
  Omit,
  #[default]
  SameOrigin,
  Include,
}

/// Ordered, case-insensitive header multimap.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
  pub fn new() -> Self {
    Self::default()
  }

  /// First value for `name`.
  pub fn get(&self, name: &str) -> Option<&str> {
    self
      .0
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// All values for `name`, joined the way HTTP combines repeated fields.
  pub fn get_combined(&self, name: &str) -> Option<String> {
    let values: Vec<&str> = self
      .0
      .iter()
      .filter(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
      .collect();
    if values.is_empty() {
      None
    } else {
      Some(values.join(", "))
    }
  }

  pub fn contains(&self, name: &str) -> bool {
    self.get(name).is_some()
  }

  /// Replace every value of `name` with a single value.
  pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    self.remove(&name);
    self.0.push((name, value.into()));
  }

  pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
    self.0.push((name.into(), value.into()));
  }

  pub fn remove(&mut self, name: &str) {
    self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
  fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
    Headers(
      iter
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect(),
    )
  }
}

/// An outgoing HTTP request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Headers,
  pub body: Bytes,
  pub credentials: Credentials,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Headers::new(),
      body: Bytes::new(),
      credentials: Credentials::default(),
    }
  }

  /// Parse `url` and build a request for it.
  pub fn parse(method: Method, url: &str) -> Result<Self> {
    let url = Url::parse(url).map_err(|e| eyre!("Invalid request URL '{}': {}", url, e))?;
    Ok(Self::new(method, url))
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.append(name, value);
    self
  }

  pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
    self.body = body.into();
    self
  }

  pub fn with_json<T: Serialize>(mut self, value: &T) -> Result<Self> {
    let body =
      serde_json::to_vec(value).map_err(|e| eyre!("Failed to serialize request body: {}", e))?;
    self.body = Bytes::from(body);
    self.headers.set("Content-Type", "application/json");
    Ok(self)
  }

  /// Last non-empty path segment, used as the row id of item URLs.
  pub fn last_path_segment(&self) -> Option<String> {
    self
      .url
      .path_segments()
      .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
      .map(String::from)
  }

  /// Plain-data form used by the sync log.
  pub fn to_snapshot(&self) -> RequestSnapshot {
    RequestSnapshot {
      method: self.method,
      url: self.url.to_string(),
      headers: self.headers.clone(),
      body: BASE64.encode(&self.body),
      credentials: self.credentials,
    }
  }

  pub fn from_snapshot(snapshot: RequestSnapshot) -> Result<Self> {
    let url = Url::parse(&snapshot.url)
      .map_err(|e| eyre!("Invalid URL in request snapshot '{}': {}", snapshot.url, e))?;
    let body = BASE64
      .decode(snapshot.body.as_bytes())
      .map_err(|e| eyre!("Invalid body in request snapshot: {}", e))?;
    Ok(Self {
      method: snapshot.method,
      url,
      headers: snapshot.headers,
      body: Bytes::from(body),
      credentials: snapshot.credentials,
    })
  }
}

/// A received (or synthesized) HTTP response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
  pub status: u16,
  pub status_text: String,
  pub headers: Headers,
  pub body: Bytes,
  pub url: String,
  /// True when the response was rehydrated from the local cache or stores.
  pub is_cached: bool,
}

impl Response {
  pub fn new(status: u16, status_text: impl Into<String>) -> Self {
    Self {
      status,
      status_text: status_text.into(),
      headers: Headers::new(),
      body: Bytes::new(),
      url: String::new(),
      is_cached: false,
    }
  }

  /// A locally generated response; the body is used verbatim.
  pub fn synthetic(status: u16, status_text: impl Into<String>, body: impl Into<Bytes>) -> Self {
    Self {
      body: body.into(),
      ..Self::new(status, status_text)
    }
  }

  pub fn with_url(mut self, url: impl Into<String>) -> Self {
    self.url = url.into();
    self
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.append(name, value);
    self
  }

  pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
    self.body = body.into();
    self
  }

  pub fn ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
    serde_json::from_slice(&self.body)
  }

  /// Directives of the Cache-Control header, lowercased.
  pub fn cache_control(&self) -> Vec<String> {
    self
      .headers
      .get_combined("Cache-Control")
      .map(|value| parse_directives(&value))
      .unwrap_or_default()
  }

  pub fn has_cache_directive(&self, directive: &str) -> bool {
    self
      .cache_control()
      .iter()
      .any(|d| d == directive || d.starts_with(&format!("{}=", directive)))
  }

  /// Freshness stamp written by the cache strategy, if any.
  pub fn cache_expiration(&self) -> Option<DateTime<Utc>> {
    self
      .headers
      .get(CACHE_EXPIRATION_HEADER)
      .and_then(parse_http_date)
  }

  pub fn to_snapshot(&self) -> ResponseSnapshot {
    ResponseSnapshot {
      status: self.status,
      status_text: self.status_text.clone(),
      headers: self.headers.clone(),
      body: BASE64.encode(&self.body),
      url: self.url.clone(),
    }
  }

  /// Rebuild a response from plain data. Rehydrated responses are always
  /// flagged as cached.
  pub fn from_snapshot(snapshot: ResponseSnapshot) -> Result<Self> {
    let body = BASE64
      .decode(snapshot.body.as_bytes())
      .map_err(|e| eyre!("Invalid body in response snapshot: {}", e))?;
    Ok(Self {
      status: snapshot.status,
      status_text: snapshot.status_text,
      headers: snapshot.headers,
      body: Bytes::from(body),
      url: snapshot.url,
      is_cached: true,
    })
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSnapshot {
  pub method: Method,
  pub url: String,
  pub headers: Headers,
  /// Base64 encoded body
  pub body: String,
  #[serde(default)]
  pub credentials: Credentials,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseSnapshot {
  pub status: u16,
  pub status_text: String,
  pub headers: Headers,
  /// Base64 encoded body
  pub body: String,
  pub url: String,
}

/// Split a Cache-Control / Pragma value into lowercased directives.
pub fn parse_directives(value: &str) -> Vec<String> {
  value
    .split(',')
    .map(|d| d.trim().to_ascii_lowercase())
    .filter(|d| !d.is_empty())
    .collect()
}

/// Format a timestamp as an IMF-fixdate (`Sun, 06 Nov 1994 08:49:37 GMT`).
pub fn format_http_date(date: DateTime<Utc>) -> String {
  date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Parse an HTTP date. Accepts IMF-fixdate and RFC 3339 forms.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
  let value = value.trim();
  DateTime::parse_from_rfc2822(value)
    .or_else(|_| DateTime::parse_from_rfc3339(value))
    .map(|d| d.with_timezone(&Utc))
    .ok()
}
