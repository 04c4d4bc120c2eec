//! Pluggable policies applied by the proxy to GET/HEAD requests.
//!
//! A [`FetchStrategy`] decides whether a request is served from the network or
//! from local data. A [`CacheStrategy`] post-processes successful responses
//! according to HTTP cache-control semantics and decides what gets cached.

mod cache_control;
mod fetch;

pub use cache_control::{CacheStrategy, HttpCacheStrategy};
pub use fetch::{
  fetch_from_cache_or_server_if_empty, BackgroundFetch, CacheFirstStrategy,
  CacheIfOfflineStrategy, FetchStrategy, ServerResponseCallback,
};

use crate::http::Response;

/// 503 returned when neither the cache nor the network can answer.
pub fn no_cached_response() -> Response {
  Response::synthetic(503, "No cached response exists", "")
}
