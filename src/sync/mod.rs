//! Sync queue contract and the undo/redo records carried with each entry.
//!
//! The proxy writes mutating requests it could not confirm with the server
//! into a [`SyncManager`]. [`SyncLog`] is the SQLite-backed implementation
//! that also replays the queue once connectivity returns.

mod queue;

pub use queue::{SyncEntry, SyncLog, SyncReport};

use async_trait::async_trait;
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::http::Request;

/// Store operation a shredded response triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreOperation {
  Upsert,
  Remove,
}

/// Before/after snapshot of one row. `None` means the row did not exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoRedoEntry {
  pub key: String,
  pub undo: Option<Value>,
  pub redo: Option<Value>,
}

/// Row snapshots for one store touched by a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoRedoData {
  pub store_name: String,
  pub operation: StoreOperation,
  pub undo_redo_data: Vec<UndoRedoEntry>,
}

/// Receives mutating requests that still have to reach the server.
#[async_trait]
pub trait SyncManager: Send + Sync {
  async fn insert_request(&self, request: &Request, undo_redo: &[UndoRedoData]) -> Result<()>;
}
