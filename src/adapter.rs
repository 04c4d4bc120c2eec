//! XMLHttpRequest-style front end for the response proxy.

use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::debug;

use crate::http::{Credentials, Method, Request, Response};
use crate::proxy::DefaultResponseProxy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyState {
  Unsent = 0,
  Opened = 1,
  HeadersReceived = 2,
  Loading = 3,
  Done = 4,
}

/// One request/response exchange with the open/send/read call pattern of
/// XMLHttpRequest. Every request goes through the wrapped proxy.
pub struct XhrAdapter {
  proxy: Arc<DefaultResponseProxy>,
  state: ReadyState,
  request: Option<Request>,
  with_credentials: bool,
  response: Option<Response>,
}

impl XhrAdapter {
  pub fn new(proxy: Arc<DefaultResponseProxy>) -> Self {
    Self {
      proxy,
      state: ReadyState::Unsent,
      request: None,
      with_credentials: false,
      response: None,
    }
  }

  /// Start a new exchange, discarding the previous one.
  pub fn open(&mut self, method: &str, url: &str) -> Result<()> {
    let method: Method = method.parse()?;
    self.request = Some(Request::parse(method, url)?);
    self.response = None;
    self.state = ReadyState::Opened;
    Ok(())
  }

  pub fn set_request_header(&mut self, name: &str, value: &str) -> Result<()> {
    match (&mut self.request, self.state) {
      (Some(request), ReadyState::Opened) => {
        request.headers.append(name, value);
        Ok(())
      }
      _ => Err(eyre!("set_request_header called before open")),
    }
  }

  pub fn set_with_credentials(&mut self, with_credentials: bool) -> Result<()> {
    if self.state > ReadyState::Opened {
      return Err(eyre!("with_credentials cannot change after send"));
    }
    self.with_credentials = with_credentials;
    Ok(())
  }

  /// Run the opened request through the proxy.
  pub async fn send(&mut self, body: Option<Bytes>) -> Result<()> {
    if self.state != ReadyState::Opened {
      return Err(eyre!("send called in state {:?}", self.state));
    }
    let mut request = self
      .request
      .take()
      .ok_or_else(|| eyre!("send called before open"))?;

    if let Some(body) = body {
      if request.method.is_cacheable() {
        debug!(method = %request.method, "ignoring body of bodiless method");
      } else {
        request.body = body;
      }
    }
    request.credentials = if self.with_credentials {
      Credentials::Include
    } else {
      Credentials::SameOrigin
    };

    let result = self.proxy.process_request(&request).await;
    self.state = ReadyState::Done;
    self.request = Some(request);
    self.response = Some(result?);
    Ok(())
  }

  /// Accepted for compatibility; an in-flight request cannot be cancelled.
  pub fn abort(&self) {
    debug!("abort is a no-op");
  }

  pub fn ready_state(&self) -> ReadyState {
    self.state
  }

  /// 0 until a response arrived.
  pub fn status(&self) -> u16 {
    self.response.as_ref().map_or(0, |r| r.status)
  }

  pub fn status_text(&self) -> &str {
    self.response.as_ref().map_or("", |r| r.status_text.as_str())
  }

  pub fn response_text(&self) -> String {
    self.response.as_ref().map(Response::text).unwrap_or_default()
  }

  pub fn response_bytes(&self) -> Bytes {
    self
      .response
      .as_ref()
      .map(|r| r.body.clone())
      .unwrap_or_default()
  }

  pub fn response_url(&self) -> &str {
    self.response.as_ref().map_or("", |r| r.url.as_str())
  }

  /// Values of `name` joined with `", "`.
  pub fn get_response_header(&self, name: &str) -> Option<String> {
    self.response.as_ref()?.headers.get_combined(name)
  }

  /// `name: value` lines with lowercase names, each ending in CRLF.
  pub fn get_all_response_headers(&self) -> String {
    let Some(response) = &self.response else {
      return String::new();
    };
    response
      .headers
      .iter()
      .map(|(name, value)| format!("{}: {}\r\n", name.to_ascii_lowercase(), value))
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::Database;
  use crate::http::OnlineFlag;
  use crate::test_support::MockTransport;

  const URL: &str = "https://example.com/notes";

  fn adapter(transport: Arc<MockTransport>, online: bool) -> XhrAdapter {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let proxy =
      DefaultResponseProxy::builder(db, transport, Arc::new(OnlineFlag::new(online))).build();
    XhrAdapter::new(Arc::new(proxy))
  }

  #[tokio::test]
  async fn test_get_round_trip() {
    let transport = Arc::new(MockTransport::new());
    transport.respond(
      URL,
      Response::synthetic(200, "OK", "hello")
        .with_header("Content-Type", "text/plain")
        .with_header("X-Tag", "a")
        .with_header("x-tag", "b"),
    );
    let mut xhr = adapter(transport.clone(), true);
    assert_eq!(xhr.ready_state(), ReadyState::Unsent);

    xhr.open("get", URL).unwrap();
    xhr.set_request_header("Accept", "text/plain").unwrap();
    xhr.set_with_credentials(true).unwrap();
    assert_eq!(xhr.ready_state(), ReadyState::Opened);
    assert_eq!(xhr.status(), 0);

    xhr.send(None).await.unwrap();
    assert_eq!(xhr.ready_state(), ReadyState::Done);
    assert_eq!(xhr.status(), 200);
    assert_eq!(xhr.status_text(), "OK");
    assert_eq!(xhr.response_text(), "hello");
    assert_eq!(xhr.response_url(), URL);
    assert_eq!(xhr.get_response_header("x-tag").as_deref(), Some("a, b"));
    assert!(xhr
      .get_all_response_headers()
      .starts_with("content-type: text/plain\r\nx-tag: a\r\n"));

    let sent = &transport.requests()[0];
    assert_eq!(sent.headers.get("accept"), Some("text/plain"));
    assert_eq!(sent.credentials, Credentials::Include);
  }

  #[tokio::test]
  async fn test_out_of_order_calls() {
    let mut xhr = adapter(Arc::new(MockTransport::new()), true);
    assert!(xhr.send(None).await.is_err());
    assert!(xhr.set_request_header("A", "b").is_err());
    assert!(xhr.open("BREW", URL).is_err());

    xhr.open("GET", URL).unwrap();
    xhr.send(None).await.unwrap();
    assert!(xhr.send(None).await.is_err());
    assert!(xhr.set_with_credentials(true).is_err());
    xhr.abort();
  }

  #[tokio::test]
  async fn test_offline_put_body() {
    let mut xhr = adapter(Arc::new(MockTransport::new()), false);
    xhr.open("PUT", "https://example.com/notes/1").unwrap();
    xhr.send(Some(Bytes::from_static(b"{\"id\":1}"))).await.unwrap();

    assert_eq!(xhr.status(), 200);
    assert_eq!(xhr.response_bytes(), Bytes::from_static(b"{\"id\":1}"));
  }
}
