//! SQLite-backed response cache.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use tracing::debug;

use super::key::RequestFingerprint;
use crate::db::Database;
use crate::http::{Request, Response, ResponseSnapshot};

/// Options for cache lookups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchOptions {
  /// Exclude the query string from the lookup key.
  pub ignore_search: bool,
}

impl MatchOptions {
  pub fn ignore_search() -> Self {
    Self {
      ignore_search: true,
    }
  }
}

/// Summary of a cached entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedRequest {
  pub method: String,
  pub url: String,
  pub cached_at: String,
}

/// Durable request -> response cache.
#[derive(Clone)]
pub struct ResponseCache {
  db: Arc<Database>,
}

impl ResponseCache {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  pub fn has_match(&self, request: &Request, options: MatchOptions) -> Result<bool> {
    Ok(self.match_request(request, options)?.is_some())
  }

  /// Cached response for `request`. Returned responses are flagged as cached.
  ///
  /// With `ignore_search`, an exact URL match wins; otherwise the most
  /// recently stored entry for the same method and path is returned.
  pub fn match_request(
    &self,
    request: &Request,
    options: MatchOptions,
  ) -> Result<Option<Response>> {
    let fingerprint = RequestFingerprint::of(request);
    let conn = self.db.conn()?;

    let mut raw: Option<String> = conn
      .query_row(
        "SELECT response FROM cache_entries WHERE cache_key = ?",
        params![fingerprint.cache_hash()],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache: {}", e))?;

    if raw.is_none() && options.ignore_search {
      raw = conn
        .query_row(
          "SELECT response FROM cache_entries WHERE search_key = ? ORDER BY rowid DESC LIMIT 1",
          params![fingerprint.search_hash()],
          |row| row.get(0),
        )
        .optional()
        .map_err(|e| eyre!("Failed to query cache: {}", e))?;
    }

    match raw {
      Some(text) => {
        let snapshot: ResponseSnapshot = serde_json::from_str(&text)
          .map_err(|e| eyre!("Failed to deserialize cached response: {}", e))?;
        Ok(Some(Response::from_snapshot(snapshot)?))
      }
      None => Ok(None),
    }
  }

  /// Store `response` for `request`, replacing any previous entry.
  pub fn put(&self, request: &Request, response: &Response) -> Result<()> {
    if !request.method.is_cacheable() {
      return Err(eyre!(
        "Refusing to cache response for {} {}",
        request.method,
        request.url
      ));
    }

    let fingerprint = RequestFingerprint::of(request);
    let data = serde_json::to_string(&response.to_snapshot())
      .map_err(|e| eyre!("Failed to serialize response: {}", e))?;

    self
      .db
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO cache_entries
           (cache_key, search_key, method, url, response, cached_at)
         VALUES (?, ?, ?, ?, ?, datetime('now'))",
        params![
          fingerprint.cache_hash(),
          fingerprint.search_hash(),
          fingerprint.method.as_str(),
          fingerprint.url.as_str(),
          data
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    debug!(method = %request.method, url = %request.url, "cached response");
    Ok(())
  }

  /// Remove the entry for `request`. Returns whether one existed.
  pub fn delete(&self, request: &Request) -> Result<bool> {
    let fingerprint = RequestFingerprint::of(request);
    let removed = self
      .db
      .conn()?
      .execute(
        "DELETE FROM cache_entries WHERE cache_key = ?",
        params![fingerprint.cache_hash()],
      )
      .map_err(|e| eyre!("Failed to delete cache entry: {}", e))?;
    Ok(removed > 0)
  }

  pub fn keys(&self) -> Result<Vec<CachedRequest>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT method, url, cached_at FROM cache_entries ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;
    let entries = stmt
      .query_map([], |row| {
        Ok(CachedRequest {
          method: row.get(0)?,
          url: row.get(1)?,
          cached_at: row.get(2)?,
        })
      })
      .map_err(|e| eyre!("Failed to list cache entries: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;
    Ok(entries)
  }

  /// Remove every entry. Returns the number removed.
  pub fn clear(&self) -> Result<usize> {
    self
      .db
      .conn()?
      .execute("DELETE FROM cache_entries", [])
      .map_err(|e| eyre!("Failed to clear cache: {}", e))
  }
}
