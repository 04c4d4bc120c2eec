//! Named key/value stores holding shredded rows.
//!
//! Every store lives in the shared SQLite database. Rows keep the position of
//! their first insert, so collection order survives upserts.

mod selector;

pub use selector::{lookup, scalar_text, Selector};

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::db::Database;

/// A single stored row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreRow {
  pub key: String,
  pub value: Value,
}

/// Opens and manages the lifecycle of named stores.
#[derive(Clone)]
pub struct StoreManager {
  db: Arc<Database>,
}

impl StoreManager {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  /// Open `name`, creating it if absent. Idempotent.
  pub fn open_store(&self, name: &str) -> Result<Store> {
    self
      .db
      .conn()?
      .execute(
        "INSERT OR IGNORE INTO stores (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| eyre!("Failed to open store {}: {}", name, e))?;

    Ok(Store {
      name: name.to_string(),
      db: Arc::clone(&self.db),
    })
  }

  pub fn store_names(&self) -> Result<Vec<String>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM stores ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;
    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list stores: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read store name: {}", e))?;
    Ok(names)
  }

  /// Drop a store and all of its rows. Returns whether it existed.
  pub fn delete_store(&self, name: &str) -> Result<bool> {
    let conn = self.db.conn()?;
    conn
      .execute("DELETE FROM store_rows WHERE store_name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete rows of store {}: {}", name, e))?;
    let removed = conn
      .execute("DELETE FROM stores WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete store {}: {}", name, e))?;
    Ok(removed > 0)
  }
}

/// Handle to one named store.
#[derive(Clone)]
pub struct Store {
  name: String,
  db: Arc<Database>,
}

impl Store {
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Row value for `key`, or `None` when the key is not stored.
  pub fn find_by_key(&self, key: &str) -> Result<Option<Value>> {
    let conn = self.db.conn()?;
    let raw: Option<String> = conn
      .query_row(
        "SELECT value FROM store_rows WHERE store_name = ? AND row_key = ?",
        params![self.name, key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {} in store {}: {}", key, self.name, e))?;

    raw
      .map(|text| {
        serde_json::from_str(&text)
          .map_err(|e| eyre!("Failed to deserialize row {} of store {}: {}", key, self.name, e))
      })
      .transpose()
  }

  /// Rows matching `selector`, in insertion order.
  pub fn find(&self, selector: &Selector) -> Result<Vec<StoreRow>> {
    let selector = selector.compile()?;
    let rows = self.all_rows()?;
    let mut matched = Vec::new();
    for row in rows {
      if selector.matches(&row.value)? {
        matched.push(row);
      }
    }
    Ok(matched)
  }

  pub fn keys(&self) -> Result<Vec<String>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT row_key FROM store_rows WHERE store_name = ? ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;
    let keys = stmt
      .query_map(params![self.name], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list keys of store {}: {}", self.name, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read key: {}", e))?;
    Ok(keys)
  }

  pub fn upsert(&self, key: &str, value: &Value) -> Result<()> {
    self.upsert_all(&[StoreRow {
      key: key.to_string(),
      value: value.clone(),
    }])
  }

  /// Insert or replace `rows` in one transaction.
  pub fn upsert_all(&self, rows: &[StoreRow]) -> Result<()> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for row in rows {
      let data = serde_json::to_string(&row.value)
        .map_err(|e| eyre!("Failed to serialize row {}: {}", row.key, e))?;
      tx.execute(
        "INSERT INTO store_rows (store_name, row_key, value, updated_at)
         VALUES (?, ?, ?, datetime('now'))
         ON CONFLICT (store_name, row_key)
         DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![self.name, row.key, data],
      )
      .map_err(|e| eyre!("Failed to store row {}: {}", row.key, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    debug!(store = %self.name, rows = rows.len(), "upserted rows");
    Ok(())
  }

  /// Remove `key`. Returns whether a row was removed.
  pub fn remove_by_key(&self, key: &str) -> Result<bool> {
    let removed = self
      .db
      .conn()?
      .execute(
        "DELETE FROM store_rows WHERE store_name = ? AND row_key = ?",
        params![self.name, key],
      )
      .map_err(|e| eyre!("Failed to remove {} from store {}: {}", key, self.name, e))?;
    Ok(removed > 0)
  }

  /// Remove every row matching `selector`. Returns the number removed.
  pub fn delete(&self, selector: &Selector) -> Result<usize> {
    let mut removed = 0;
    for row in self.find(selector)? {
      if self.remove_by_key(&row.key)? {
        removed += 1;
      }
    }
    Ok(removed)
  }

  fn all_rows(&self) -> Result<Vec<StoreRow>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT row_key, value FROM store_rows WHERE store_name = ? ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let raw = stmt
      .query_map(params![self.name], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
      })
      .map_err(|e| eyre!("Failed to query store {}: {}", self.name, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read row: {}", e))?;

    raw
      .into_iter()
      .map(|(key, text)| {
        let value = serde_json::from_str(&text)
          .map_err(|e| eyre!("Failed to deserialize row {} of store {}: {}", key, self.name, e))?;
        Ok(StoreRow { key, value })
      })
      .collect()
  }
}
