use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use tracing::{info, warn};

use super::{SyncManager, UndoRedoData};
use crate::db::Database;
use crate::http::{Connectivity, Request, RequestSnapshot, Transport};
use crate::store::StoreManager;

/// A queued request.
#[derive(Debug, Clone)]
pub struct SyncEntry {
  pub id: i64,
  pub request: Request,
  pub undo_redo: Vec<UndoRedoData>,
  pub created_at: String,
}

/// Outcome of a replay run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
  /// Entries sent and removed from the log
  pub replayed: usize,
  /// Entry that stopped the run, if any
  pub failed: Option<i64>,
  /// Entries still queued
  pub remaining: usize,
}

/// Durable queue of mutating requests, replayed in insertion order.
#[derive(Clone)]
pub struct SyncLog {
  db: Arc<Database>,
  stores: StoreManager,
}

impl SyncLog {
  pub fn new(db: Arc<Database>) -> Self {
    let stores = StoreManager::new(Arc::clone(&db));
    Self { db, stores }
  }

  pub fn entries(&self) -> Result<Vec<SyncEntry>> {
    let raw = {
      let conn = self.db.conn()?;
      let mut stmt = conn
        .prepare("SELECT id, request, undo_redo, created_at FROM sync_log ORDER BY id")
        .map_err(|e| eyre!("Failed to prepare query: {}", e))?;
      let rows = stmt
        .query_map([], |row| {
          Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
          ))
        })
        .map_err(|e| eyre!("Failed to query sync log: {}", e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| eyre!("Failed to read sync entry: {}", e))?;
      rows
    };

    raw
      .into_iter()
      .map(|(id, request, undo_redo, created_at)| {
        decode_entry(id, &request, &undo_redo, created_at)
      })
      .collect()
  }

  pub fn get(&self, id: i64) -> Result<Option<SyncEntry>> {
    let raw: Option<(String, String, String)> = self
      .db
      .conn()?
      .query_row(
        "SELECT request, undo_redo, created_at FROM sync_log WHERE id = ?",
        params![id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query sync entry {}: {}", id, e))?;

    raw
      .map(|(request, undo_redo, created_at)| decode_entry(id, &request, &undo_redo, created_at))
      .transpose()
  }

  pub fn len(&self) -> Result<usize> {
    let count: i64 = self
      .db
      .conn()?
      .query_row("SELECT COUNT(*) FROM sync_log", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count sync entries: {}", e))?;
    Ok(count as usize)
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  /// Drop an entry without replaying it. Returns whether it existed.
  pub fn remove_request(&self, id: i64) -> Result<bool> {
    let removed = self
      .db
      .conn()?
      .execute("DELETE FROM sync_log WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove sync entry {}: {}", id, e))?;
    Ok(removed > 0)
  }

  /// Restore the rows an entry changed to their state before the request.
  pub fn undo(&self, id: i64) -> Result<()> {
    let entry = self
      .get(id)?
      .ok_or_else(|| eyre!("No sync entry with id {}", id))?;

    for data in entry.undo_redo.iter().rev() {
      let store = self.stores.open_store(&data.store_name)?;
      for row in data.undo_redo_data.iter().rev() {
        match &row.undo {
          Some(value) => store.upsert(&row.key, value)?,
          None => {
            store.remove_by_key(&row.key)?;
          }
        }
      }
    }
    info!(id, "undid sync entry");
    Ok(())
  }

  /// Re-apply the rows an entry changed.
  pub fn redo(&self, id: i64) -> Result<()> {
    let entry = self
      .get(id)?
      .ok_or_else(|| eyre!("No sync entry with id {}", id))?;

    for data in &entry.undo_redo {
      let store = self.stores.open_store(&data.store_name)?;
      for row in &data.undo_redo_data {
        match &row.redo {
          Some(value) => store.upsert(&row.key, value)?,
          None => {
            store.remove_by_key(&row.key)?;
          }
        }
      }
    }
    info!(id, "redid sync entry");
    Ok(())
  }

  /// Replay queued requests in order while online.
  ///
  /// An entry is removed once the server answers with anything but a 5xx.
  /// The run stops at the first network failure or 5xx, leaving that entry
  /// and everything after it queued.
  pub async fn sync(
    &self,
    transport: &dyn Transport,
    connectivity: &dyn Connectivity,
  ) -> Result<SyncReport> {
    let mut report = SyncReport::default();

    for entry in self.entries()? {
      if !connectivity.is_online() {
        info!("offline, stopping replay");
        break;
      }

      match transport.send(&entry.request).await {
        Ok(response) if response.status < 500 => {
          info!(
            id = entry.id,
            status = response.status,
            method = %entry.request.method,
            url = %entry.request.url,
            "replayed request"
          );
          self.remove_request(entry.id)?;
          report.replayed += 1;
        }
        Ok(response) => {
          warn!(id = entry.id, status = response.status, "server error during replay");
          report.failed = Some(entry.id);
          break;
        }
        Err(e) => {
          warn!(id = entry.id, "network failure during replay: {}", e);
          report.failed = Some(entry.id);
          break;
        }
      }
    }

    report.remaining = self.len()?;
    Ok(report)
  }
}

fn decode_entry(id: i64, request: &str, undo_redo: &str, created_at: String) -> Result<SyncEntry> {
  let snapshot: RequestSnapshot = serde_json::from_str(request)
    .map_err(|e| eyre!("Failed to deserialize request of sync entry {}: {}", id, e))?;
  let undo_redo = serde_json::from_str(undo_redo)
    .map_err(|e| eyre!("Failed to deserialize undo data of sync entry {}: {}", id, e))?;
  Ok(SyncEntry {
    id,
    request: Request::from_snapshot(snapshot)?,
    undo_redo,
    created_at,
  })
}

#[async_trait]
impl SyncManager for SyncLog {
  async fn insert_request(&self, request: &Request, undo_redo: &[UndoRedoData]) -> Result<()> {
    let request_data = serde_json::to_string(&request.to_snapshot())
      .map_err(|e| eyre!("Failed to serialize request: {}", e))?;
    let undo_data = serde_json::to_string(undo_redo)
      .map_err(|e| eyre!("Failed to serialize undo data: {}", e))?;

    self
      .db
      .conn()?
      .execute(
        "INSERT INTO sync_log (request, undo_redo, created_at) VALUES (?, ?, datetime('now'))",
        params![request_data, undo_data],
      )
      .map_err(|e| eyre!("Failed to insert sync entry: {}", e))?;

    info!(method = %request.method, url = %request.url, "queued request for sync");
    Ok(())
  }
}
