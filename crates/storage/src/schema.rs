use rusqlite::Connection;

use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA cache_size = -32000;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, unixepoch());

CREATE TABLE IF NOT EXISTS identity_map (
    remote_id TEXT PRIMARY KEY CHECK (length(trim(remote_id)) > 0),
    entity_kind TEXT NOT NULL,
    native_id INTEGER NOT NULL CHECK (native_id > 0),
    fingerprint BLOB CHECK (fingerprint IS NULL OR length(fingerprint) = 32),
    bound_at INTEGER NOT NULL DEFAULT (unixepoch()),
    touched_at INTEGER NOT NULL DEFAULT (unixepoch()),
    UNIQUE (entity_kind, native_id)
);

CREATE TABLE IF NOT EXISTS pending_relations (
    rowid INTEGER PRIMARY KEY,
    entity_kind TEXT NOT NULL,
    field_key TEXT NOT NULL,
    owner_native_id INTEGER NOT NULL CHECK (owner_native_id > 0),
    target_remote_id TEXT NOT NULL CHECK (length(trim(target_remote_id)) > 0),
    UNIQUE (entity_kind, field_key, owner_native_id, target_remote_id)
);
CREATE INDEX IF NOT EXISTS idx_pending_target ON pending_relations (target_remote_id);
CREATE INDEX IF NOT EXISTS idx_pending_slot ON pending_relations (entity_kind, field_key, owner_native_id);

CREATE TABLE IF NOT EXISTS records (
    native_id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_kind TEXT NOT NULL,
    location INTEGER NOT NULL DEFAULT 0 CHECK (location >= 0),
    language TEXT,
    workspace INTEGER,
    deleted INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL DEFAULT (unixepoch()),
    updated_at INTEGER NOT NULL DEFAULT (unixepoch())
);
CREATE INDEX IF NOT EXISTS idx_records_kind ON records (entity_kind) WHERE deleted = 0;

CREATE TABLE IF NOT EXISTS record_fields (
    native_id INTEGER NOT NULL REFERENCES records (native_id),
    field_key TEXT NOT NULL,
    value BLOB NOT NULL,
    PRIMARY KEY (native_id, field_key)
);

CREATE TABLE IF NOT EXISTS reference_index (
    native_id INTEGER NOT NULL REFERENCES records (native_id),
    field_key TEXT NOT NULL,
    target_kind TEXT NOT NULL,
    target_native_id INTEGER NOT NULL,
    PRIMARY KEY (native_id, field_key, target_kind, target_native_id)
);
CREATE INDEX IF NOT EXISTS idx_reference_target ON reference_index (target_kind, target_native_id);
";
