//! HTTP cache-control handling for successful GET/HEAD responses.
//!
//! Stages run in order, each either passing the response on or answering
//! directly:
//!
//! 1. `Expires` stamps the freshness header unless one is present
//! 2. `max-age` overrides it, relative to the request's `Date` (or now)
//! 3. `If-Match` / `If-None-Match` give 412 offline, revalidate online
//! 4. `must-revalidate` on an expired entry revalidates, 504 when offline
//! 5. `no-cache` (or request `Pragma: no-cache`) revalidates
//! 6. `no-store` drops the stamp and skips the cache
//! 7. anything else is written to the cache

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::Result;
use tracing::{debug, info, warn};

use crate::http::{
  format_http_date, parse_directives, parse_http_date, Request, Response, CACHE_EXPIRATION_HEADER,
};
use crate::proxy::ProxyContext;

#[async_trait]
pub trait CacheStrategy: Send + Sync {
  async fn apply(&self, request: &Request, response: Response, ctx: &ProxyContext)
    -> Result<Response>;
}

/// Result of checking a cached response against the server.
enum Revalidation {
  /// Cached copy stays valid (skipped, or confirmed by a 304)
  Kept(Response),
  /// Server sent a new representation; the stale entry is gone
  Replaced(Response),
  /// Request cannot be answered (504)
  Rejected(Response),
}

/// Standard HTTP caching semantics.
#[derive(Debug, Clone, Default)]
pub struct HttpCacheStrategy;

#[async_trait]
impl CacheStrategy for HttpCacheStrategy {
  async fn apply(
    &self,
    request: &Request,
    response: Response,
    ctx: &ProxyContext,
  ) -> Result<Response> {
    if !request.method.is_cacheable() || !response.ok() {
      return Ok(response);
    }

    let mut response = response;
    stamp_expiration(request, &mut response);

    if has_conditional_headers(request) {
      if ctx.is_online() {
        response = match revalidate(request, response, false, ctx).await? {
          Revalidation::Kept(r) => r,
          Revalidation::Replaced(r) => replaced(request, r),
          Revalidation::Rejected(r) => return Ok(r),
        };
      } else if let Some(failed) = conditional_failure(request, &response) {
        info!(url = %request.url, "conditional request failed while offline");
        return Ok(failed);
      }
    }

    if response.has_cache_directive("must-revalidate") && is_expired(&response) {
      response = match revalidate(request, response, true, ctx).await? {
        Revalidation::Kept(r) => r,
        Revalidation::Replaced(r) => replaced(request, r),
        Revalidation::Rejected(r) => return Ok(r),
      };
    }

    if response.has_cache_directive("no-cache") || request_pragma_no_cache(request) {
      response = match revalidate(request, response, false, ctx).await? {
        Revalidation::Kept(r) => r,
        Revalidation::Replaced(r) => replaced(request, r),
        Revalidation::Rejected(r) => return Ok(r),
      };
    }

    if !response.ok() {
      return Ok(response);
    }

    if response.has_cache_directive("no-store") {
      debug!(url = %request.url, "no-store, not caching");
      response.headers.remove(CACHE_EXPIRATION_HEADER);
      return Ok(response);
    }

    if !response.is_cached {
      ctx.cache.put(request, &response)?;
    }
    Ok(response)
  }
}

/// A replacement from the server gets its own freshness stamp.
fn replaced(request: &Request, mut response: Response) -> Response {
  stamp_expiration(request, &mut response);
  response
}

/// Stages 1 and 2. Cached responses keep the stamp they were stored with.
fn stamp_expiration(request: &Request, response: &mut Response) {
  if response.is_cached {
    return;
  }

  if !response.headers.contains(CACHE_EXPIRATION_HEADER) {
    if let Some(expires) = response.headers.get("Expires").map(String::from) {
      // An unparseable Expires means already expired
      let stamp = parse_http_date(&expires).unwrap_or_else(Utc::now);
      response
        .headers
        .set(CACHE_EXPIRATION_HEADER, format_http_date(stamp));
    }
  }

  if let Some(max_age) = max_age(response) {
    let base = request
      .headers
      .get("Date")
      .and_then(parse_http_date)
      .unwrap_or_else(Utc::now);
    let secs = base
      .timestamp()
      .saturating_add(max_age)
      .min(LATEST_EXPIRATION);
    if let Some(expires) = DateTime::from_timestamp(secs, 0) {
      response
        .headers
        .set(CACHE_EXPIRATION_HEADER, format_http_date(expires));
    }
  }
}

/// 9999-12-31T23:59:59Z, the last instant an HTTP date can carry.
const LATEST_EXPIRATION: i64 = 253_402_300_799;

fn max_age(response: &Response) -> Option<i64> {
  response.cache_control().iter().find_map(|directive| {
    directive
      .strip_prefix("max-age=")
      .and_then(|v| v.trim_matches('"').parse::<u64>().ok())
      .map(|v| i64::try_from(v).unwrap_or(i64::MAX))
  })
}

fn is_expired(response: &Response) -> bool {
  response
    .cache_expiration()
    .is_some_and(|expiration| Utc::now() > expiration)
}

fn has_conditional_headers(request: &Request) -> bool {
  request.headers.contains("If-Match") || request.headers.contains("If-None-Match")
}

fn request_pragma_no_cache(request: &Request) -> bool {
  request
    .headers
    .get_combined("Pragma")
    .is_some_and(|p| parse_directives(&p).iter().any(|d| d == "no-cache"))
}

fn strip_weak(tag: &str) -> &str {
  tag.trim().trim_start_matches("W/")
}

/// Whether an If-Match / If-None-Match value lists `etag`.
fn etag_listed(header: &str, etag: Option<&str>) -> bool {
  header.split(',').map(str::trim).any(|candidate| {
    candidate == "*" || etag.is_some_and(|etag| strip_weak(candidate) == strip_weak(etag))
  })
}

/// 412 when the cached ETag does not satisfy the request's conditions.
fn conditional_failure(request: &Request, response: &Response) -> Option<Response> {
  let etag = response.headers.get("ETag");

  if let Some(if_match) = request.headers.get_combined("If-Match") {
    if !etag_listed(&if_match, etag) {
      return Some(Response::synthetic(
        412,
        "If-Match failed due to no matching ETag while offline",
        "",
      ));
    }
  }

  if let Some(if_none_match) = request.headers.get_combined("If-None-Match") {
    if etag_listed(&if_none_match, etag) {
      return Some(Response::synthetic(
        412,
        "If-None-Match failed due to matching ETag while offline",
        "",
      ));
    }
  }

  None
}

/// Check a cached response with the server.
///
/// Only cached responses are revalidated. Offline, a forced revalidation is a
/// 504 and an unforced one keeps the cached copy.
async fn revalidate(
  request: &Request,
  response: Response,
  forced: bool,
  ctx: &ProxyContext,
) -> Result<Revalidation> {
  if !response.is_cached {
    return Ok(Revalidation::Kept(response));
  }

  if !ctx.is_online() {
    if forced {
      info!(url = %request.url, "must-revalidate while offline");
      return Ok(Revalidation::Rejected(gateway_timeout()));
    }
    return Ok(Revalidation::Kept(response));
  }

  let mut check = request.clone();
  if !has_conditional_headers(&check) {
    if let Some(etag) = response.headers.get("ETag") {
      check.headers.set("If-None-Match", etag);
    }
  }

  match ctx.network_fetch(&check).await {
    Ok(server) if server.status == 304 => {
      debug!(url = %request.url, "revalidated, cached copy still valid");
      Ok(Revalidation::Kept(response))
    }
    Ok(server) => {
      debug!(url = %request.url, status = server.status, "revalidation replaced cached copy");
      ctx.cache.delete(request)?;
      Ok(Revalidation::Replaced(server))
    }
    Err(e) if forced => {
      warn!(url = %request.url, "Revalidation failed: {}", e);
      Ok(Revalidation::Rejected(gateway_timeout()))
    }
    Err(e) => {
      warn!(url = %request.url, "Revalidation failed, keeping cached copy: {}", e);
      Ok(Revalidation::Kept(response))
    }
  }
}

fn gateway_timeout() -> Response {
  Response::synthetic(
    504,
    "cache-control: must-revalidate failed due to application being offline",
    "",
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MatchOptions;
  use crate::http::{Method, OnlineFlag};
  use crate::proxy::tests::context;
  use crate::test_support::MockTransport;
  use chrono::{Duration, TimeZone};
  use std::sync::Arc;

  const URL: &str = "https://example.com/items";

  fn get() -> Request {
    Request::parse(Method::Get, URL).unwrap()
  }

  fn setup() -> (Arc<ProxyContext>, Arc<MockTransport>, Arc<OnlineFlag>) {
    let transport = Arc::new(MockTransport::new());
    let online = Arc::new(OnlineFlag::new(true));
    let ctx = context(transport.clone(), online.clone(), None, None);
    (ctx, transport, online)
  }

  fn cached(ctx: &ProxyContext, response: Response) -> Response {
    ctx.cache.put(&get(), &response).unwrap();
    ctx
      .cache
      .match_request(&get(), MatchOptions::default())
      .unwrap()
      .unwrap()
  }

  #[tokio::test]
  async fn test_plain_response_is_cached() {
    let (ctx, _, _) = setup();
    let response = HttpCacheStrategy
      .apply(&get(), Response::synthetic(200, "OK", "body"), &ctx)
      .await
      .unwrap();

    assert_eq!(response.text(), "body");
    let hit = ctx
      .cache
      .match_request(&get(), MatchOptions::default())
      .unwrap()
      .unwrap();
    assert_eq!(hit.text(), "body");
    assert_eq!(hit.status, 200);
  }

  #[tokio::test]
  async fn test_expires_sets_stamp() {
    let (ctx, _, _) = setup();
    let response = HttpCacheStrategy
      .apply(
        &get(),
        Response::synthetic(200, "OK", "").with_header("Expires", "Wed, 21 Oct 2015 07:28:00 GMT"),
        &ctx,
      )
      .await
      .unwrap();
    assert_eq!(
      response.headers.get(CACHE_EXPIRATION_HEADER),
      Some("Wed, 21 Oct 2015 07:28:00 GMT")
    );
  }

  #[tokio::test]
  async fn test_max_age_overrides_expires() {
    let (ctx, _, _) = setup();
    let request = get().with_header("Date", "Sun, 06 Nov 1994 08:49:37 GMT");
    let response = HttpCacheStrategy
      .apply(
        &request,
        Response::synthetic(200, "OK", "")
          .with_header("Expires", "Wed, 21 Oct 2015 07:28:00 GMT")
          .with_header("Cache-Control", "public, max-age=60"),
        &ctx,
      )
      .await
      .unwrap();

    let expected = Utc.with_ymd_and_hms(1994, 11, 6, 8, 50, 37).unwrap();
    assert_eq!(response.cache_expiration(), Some(expected));
  }

  #[tokio::test]
  async fn test_huge_max_age_is_clamped() {
    let (ctx, _, _) = setup();
    let latest = Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).unwrap();
    for max_age in ["100000000000000", "9223372036854775807"] {
      let response = HttpCacheStrategy
        .apply(
          &get(),
          Response::synthetic(200, "OK", "")
            .with_header("Cache-Control", &format!("max-age={}", max_age)),
          &ctx,
        )
        .await
        .unwrap();
      assert_eq!(response.status, 200);
      assert_eq!(response.cache_expiration(), Some(latest), "max-age={}", max_age);
    }
  }

  #[tokio::test]
  async fn test_invalid_expires_is_already_stale() {
    let (ctx, _, _) = setup();
    let before = Utc::now() - Duration::seconds(1);
    let response = HttpCacheStrategy
      .apply(
        &get(),
        Response::synthetic(200, "OK", "").with_header("Expires", "0"),
        &ctx,
      )
      .await
      .unwrap();

    let stamp = response.cache_expiration().unwrap();
    assert!(stamp >= before && stamp <= Utc::now());
  }

  #[tokio::test]
  async fn test_no_store_is_never_cached() {
    let (ctx, _, _) = setup();
    let response = HttpCacheStrategy
      .apply(
        &get(),
        Response::synthetic(200, "OK", "secret")
          .with_header("Cache-Control", "no-store, max-age=60"),
        &ctx,
      )
      .await
      .unwrap();

    assert_eq!(response.text(), "secret");
    assert!(!response.headers.contains(CACHE_EXPIRATION_HEADER));
    assert!(!ctx.cache.has_match(&get(), MatchOptions::default()).unwrap());
  }

  #[tokio::test]
  async fn test_non_get_and_errors_pass_through() {
    let (ctx, _, _) = setup();
    let post = Request::parse(Method::Post, URL).unwrap();
    HttpCacheStrategy
      .apply(&post, Response::synthetic(200, "OK", ""), &ctx)
      .await
      .unwrap();
    HttpCacheStrategy
      .apply(&get(), Response::new(404, "Not Found"), &ctx)
      .await
      .unwrap();
    assert!(ctx.cache.keys().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_offline_if_match_mismatch_is_412() {
    let (ctx, _, online) = setup();
    let hit = cached(&ctx, Response::synthetic(200, "OK", "").with_header("ETag", "\"v1\""));
    online.set_online(false);

    let request = get().with_header("If-Match", "\"v2\"");
    let response = HttpCacheStrategy.apply(&request, hit.clone(), &ctx).await.unwrap();
    assert_eq!(response.status, 412);

    let request = get().with_header("If-Match", "W/\"v1\"");
    let response = HttpCacheStrategy.apply(&request, hit, &ctx).await.unwrap();
    assert_eq!(response.status, 200);
  }

  #[tokio::test]
  async fn test_offline_if_none_match_hit_is_412() {
    let (ctx, _, online) = setup();
    let hit = cached(&ctx, Response::synthetic(200, "OK", "").with_header("ETag", "\"v1\""));
    online.set_online(false);

    let request = get().with_header("If-None-Match", "\"v0\", \"v1\"");
    let response = HttpCacheStrategy.apply(&request, hit, &ctx).await.unwrap();
    assert_eq!(response.status, 412);
  }

  #[tokio::test]
  async fn test_must_revalidate_304_keeps_cached_copy() {
    let (ctx, transport, _) = setup();
    let hit = cached(
      &ctx,
      Response::synthetic(200, "OK", "cached")
        .with_header("Cache-Control", "must-revalidate")
        .with_header("ETag", "\"v1\"")
        .with_header(CACHE_EXPIRATION_HEADER, "Sun, 06 Nov 1994 08:49:37 GMT"),
    );
    transport.respond(URL, Response::new(304, "Not Modified"));

    let response = HttpCacheStrategy.apply(&get(), hit.clone(), &ctx).await.unwrap();
    assert_eq!(response, hit);
    assert_eq!(
      transport.requests()[0].headers.get("If-None-Match"),
      Some("\"v1\"")
    );
    let still = ctx
      .cache
      .match_request(&get(), MatchOptions::default())
      .unwrap()
      .unwrap();
    assert_eq!(still.text(), "cached");
  }

  #[tokio::test]
  async fn test_must_revalidate_replacement_is_cached() {
    let (ctx, transport, _) = setup();
    let hit = cached(
      &ctx,
      Response::synthetic(200, "OK", "old")
        .with_header("Cache-Control", "must-revalidate")
        .with_header(CACHE_EXPIRATION_HEADER, "Sun, 06 Nov 1994 08:49:37 GMT"),
    );
    transport.respond(
      URL,
      Response::synthetic(200, "OK", "new").with_header("Cache-Control", "max-age=60"),
    );

    let response = HttpCacheStrategy.apply(&get(), hit, &ctx).await.unwrap();
    assert_eq!(response.text(), "new");
    assert!(!response.is_cached);

    let entry = ctx
      .cache
      .match_request(&get(), MatchOptions::default())
      .unwrap()
      .unwrap();
    assert_eq!(entry.text(), "new");
    assert!(entry.cache_expiration().unwrap() > Utc::now());
  }

  #[tokio::test]
  async fn test_must_revalidate_offline_is_504() {
    let (ctx, transport, online) = setup();
    let hit = cached(
      &ctx,
      Response::synthetic(200, "OK", "old")
        .with_header("Cache-Control", "must-revalidate")
        .with_header(CACHE_EXPIRATION_HEADER, "Sun, 06 Nov 1994 08:49:37 GMT"),
    );
    online.set_online(false);

    let response = HttpCacheStrategy.apply(&get(), hit, &ctx).await.unwrap();
    assert_eq!(response.status, 504);
    assert_eq!(transport.request_count(), 0);
  }

  #[tokio::test]
  async fn test_fresh_must_revalidate_is_served() {
    let (ctx, transport, _) = setup();
    let hit = cached(
      &ctx,
      Response::synthetic(200, "OK", "cached")
        .with_header("Cache-Control", "must-revalidate")
        .with_header(
          CACHE_EXPIRATION_HEADER,
          &format_http_date(Utc::now() + Duration::hours(1)),
        ),
    );

    let response = HttpCacheStrategy.apply(&get(), hit, &ctx).await.unwrap();
    assert_eq!(response.text(), "cached");
    assert_eq!(transport.request_count(), 0);
  }

  #[tokio::test]
  async fn test_no_cache_offline_serves_stale() {
    let (ctx, transport, online) = setup();
    let hit = cached(
      &ctx,
      Response::synthetic(200, "OK", "cached").with_header("Cache-Control", "no-cache"),
    );
    online.set_online(false);

    let response = HttpCacheStrategy.apply(&get(), hit, &ctx).await.unwrap();
    assert_eq!(response.text(), "cached");
    assert_eq!(transport.request_count(), 0);
  }

  #[tokio::test]
  async fn test_pragma_no_cache_revalidates_online() {
    let (ctx, transport, _) = setup();
    let hit = cached(&ctx, Response::synthetic(200, "OK", "cached"));
    transport.respond(URL, Response::synthetic(200, "OK", "fresh"));

    let request = get().with_header("Pragma", "no-cache");
    let response = HttpCacheStrategy.apply(&request, hit, &ctx).await.unwrap();
    assert_eq!(response.text(), "fresh");
    assert_eq!(transport.request_count(), 1);
  }
}
