//! Network transport and connectivity seams.

use async_trait::async_trait;
use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

use super::{Headers, Method, Request, Response};

/// Sends a request over the network.
///
/// `Err` means the server could not be reached. Every HTTP status,
/// including 5xx, is an `Ok(Response)`.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, request: &Request) -> Result<Response>;
}

/// Reports whether the device currently has network connectivity.
pub trait Connectivity: Send + Sync {
  fn is_online(&self) -> bool;
}

/// Connectivity provider backed by a flag that callers flip explicitly.
#[derive(Debug)]
pub struct OnlineFlag(AtomicBool);

impl OnlineFlag {
  pub fn new(online: bool) -> Self {
    Self(AtomicBool::new(online))
  }

  pub fn set_online(&self, online: bool) {
    self.0.store(online, Ordering::SeqCst);
  }
}

impl Default for OnlineFlag {
  fn default() -> Self {
    Self::new(true)
  }
}

impl Connectivity for OnlineFlag {
  fn is_online(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}

/// `reqwest`-based transport.
#[derive(Clone)]
pub struct ReqwestTransport {
  client: reqwest::Client,
  auth_token: Option<String>,
}

impl ReqwestTransport {
  pub fn new(timeout: Duration, user_agent: &str, auth_token: Option<String>) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(user_agent)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, auth_token })
  }
}

fn to_reqwest_method(method: Method) -> reqwest::Method {
  match method {
    Method::Get => reqwest::Method::GET,
    Method::Head => reqwest::Method::HEAD,
    Method::Post => reqwest::Method::POST,
    Method::Put => reqwest::Method::PUT,
    Method::Patch => reqwest::Method::PATCH,
    Method::Delete => reqwest::Method::DELETE,
    Method::Options => reqwest::Method::OPTIONS,
  }
}

#[async_trait]
impl Transport for ReqwestTransport {
  async fn send(&self, request: &Request) -> Result<Response> {
    debug!(method = %request.method, url = %request.url, "network fetch");

    let mut builder = self
      .client
      .request(to_reqwest_method(request.method), request.url.clone());
    for (name, value) in request.headers.iter() {
      builder = builder.header(name, value);
    }
    if let Some(token) = &self.auth_token {
      if !request.headers.contains("Authorization") {
        builder = builder.bearer_auth(token);
      }
    }
    if !request.body.is_empty() {
      builder = builder.body(request.body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status();
    let url = response.url().to_string();
    let headers: Headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body: Bytes = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response body from {}: {}", url, e))?;

    Ok(Response {
      status: status.as_u16(),
      status_text: status.canonical_reason().unwrap_or_default().to_string(),
      headers,
      body,
      url,
      is_cached: false,
    })
  }
}
