/// Schema for the persistence database.
pub const SCHEMA: &str = r#"
-- Named stores, created lazily on first open
CREATE TABLE IF NOT EXISTS stores (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Shredded rows (value is serialized JSON)
CREATE TABLE IF NOT EXISTS store_rows (
    store_name TEXT NOT NULL,
    row_key TEXT NOT NULL,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (store_name, row_key)
);

-- Cached responses keyed by request fingerprint
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_key TEXT PRIMARY KEY,
    search_key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    response TEXT NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_search ON cache_entries(search_key);

-- Mutating requests waiting for replay
CREATE TABLE IF NOT EXISTS sync_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request TEXT NOT NULL,
    undo_redo TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;
