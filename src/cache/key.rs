//! Normalized request fingerprints.

use sha2::{Digest, Sha256};
use url::Url;

use crate::http::{Method, Request};

/// The (method, URL) pair a cache entry is addressed by.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestFingerprint {
  pub method: Method,
  pub url: Url,
}

impl RequestFingerprint {
  pub fn of(request: &Request) -> Self {
    let mut url = request.url.clone();
    url.set_fragment(None);
    Self {
      method: request.method,
      url,
    }
  }

  /// Key including the query string.
  pub fn cache_hash(&self) -> String {
    hash(&format!("{}:{}", self.method, self.url))
  }

  /// Key ignoring the query string.
  pub fn search_hash(&self) -> String {
    let mut base = self.url.clone();
    base.set_query(None);
    hash(&format!("{}:{}", self.method, base))
  }
}

fn hash(input: &str) -> String {
  // SHA256 hash for stable, fixed-length keys
  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  hex::encode(hasher.finalize())
}
