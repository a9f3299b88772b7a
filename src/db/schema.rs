//! SQLite schema for the record store and the trace ledger.

pub const SCHEMA: &str = r#"
-- Tagged blobs: cached entity lists and pending operations
CREATE TABLE IF NOT EXISTS records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    type_tag TEXT NOT NULL,
    payload BLOB NOT NULL,
    fingerprint TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_records_tag ON records(type_tag, id);

-- Bulk items awaiting upload (location traces)
CREATE TABLE IF NOT EXISTS trace_ledger (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    payload BLOB NOT NULL,
    sync_status TEXT NOT NULL DEFAULT 'unsynced',
    status_changed_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_trace_ledger_status
    ON trace_ledger(kind, sync_status, id);
"#;
