//! Scripted network transport for tests.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::http::{Request, Response, Transport};

enum Scripted {
  Respond(Response),
  Fail,
}

/// Replays queued responses per URL and records every request.
///
/// The last scripted outcome for a URL is sticky; unscripted URLs fail like
/// an unreachable host.
#[derive(Default)]
pub struct MockTransport {
  script: Mutex<HashMap<String, VecDeque<Scripted>>>,
  requests: Mutex<Vec<Request>>,
}

impl MockTransport {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, url: &str, response: Response) {
    self.push(url, Scripted::Respond(response));
  }

  pub fn fail(&self, url: &str) {
    self.push(url, Scripted::Fail);
  }

  fn push(&self, url: &str, outcome: Scripted) {
    self
      .script
      .lock()
      .unwrap()
      .entry(url.to_string())
      .or_default()
      .push_back(outcome);
  }

  pub fn requests(&self) -> Vec<Request> {
    self.requests.lock().unwrap().clone()
  }

  pub fn requested_urls(&self) -> Vec<String> {
    self
      .requests()
      .iter()
      .map(|r| r.url.to_string())
      .collect()
  }

  pub fn request_count(&self) -> usize {
    self.requests.lock().unwrap().len()
  }
}

#[async_trait]
impl Transport for MockTransport {
  async fn send(&self, request: &Request) -> Result<Response> {
    self.requests.lock().unwrap().push(request.clone());

    let url = request.url.to_string();
    let mut script = self.script.lock().unwrap();
    let queue = script.get_mut(&url);
    let outcome = match queue {
      Some(queue) if queue.len() > 1 => queue.pop_front(),
      Some(queue) => queue.front().map(|o| match o {
        Scripted::Respond(r) => Scripted::Respond(r.clone()),
        Scripted::Fail => Scripted::Fail,
      }),
      None => None,
    };

    match outcome {
      Some(Scripted::Respond(mut response)) => {
        if response.url.is_empty() {
          response.url = url;
        }
        Ok(response)
      }
      Some(Scripted::Fail) | None => Err(eyre!("Failed to fetch {}: connection refused", url)),
    }
  }
}
