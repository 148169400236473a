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
        PRAGMA mmap_size = 268435456;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    let version: i32 =
        conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
    if version != SCHEMA_VERSION {
        return Err(StorageError::InvalidState(format!(
            "unsupported schema version {version}"
        )));
    }
    Ok(())
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, unixepoch());

CREATE TABLE IF NOT EXISTS intake (
    seq INTEGER PRIMARY KEY,
    intake_id BLOB NOT NULL UNIQUE CHECK (length(intake_id) = 16),
    snapshot BLOB NOT NULL,
    model_type TEXT NOT NULL,
    source_system TEXT NOT NULL,
    native_id TEXT NOT NULL,
    received_at INTEGER NOT NULL,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    evidence BLOB,
    not_before INTEGER NOT NULL,
    enqueued_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_intake_ready ON intake (status, not_before, seq);
CREATE INDEX IF NOT EXISTS idx_intake_received ON intake (received_at);

CREATE TABLE IF NOT EXISTS canonical_entities (
    canonical_id BLOB PRIMARY KEY CHECK (length(canonical_id) = 16),
    model_type TEXT NOT NULL,
    version INTEGER NOT NULL,
    merged_from BLOB NOT NULL,
    redirect_to BLOB CHECK (redirect_to IS NULL OR length(redirect_to) = 16),
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_canonical_model ON canonical_entities (model_type, canonical_id) WHERE redirect_to IS NULL;

CREATE TABLE IF NOT EXISTS correlation_keys (
    model_type TEXT NOT NULL,
    tag_key TEXT NOT NULL,
    canonical_id BLOB NOT NULL CHECK (length(canonical_id) = 16),
    PRIMARY KEY (model_type, tag_key, canonical_id)
);
CREATE INDEX IF NOT EXISTS idx_correlation_owner ON correlation_keys (canonical_id);

CREATE TABLE IF NOT EXISTS property_values (
    seq INTEGER PRIMARY KEY,
    canonical_id BLOB NOT NULL CHECK (length(canonical_id) = 16),
    path TEXT NOT NULL,
    received_at INTEGER NOT NULL,
    value BLOB NOT NULL,
    source_system TEXT NOT NULL,
    native_id TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_property_values_entity ON property_values (canonical_id, path, received_at, seq);

CREATE TABLE IF NOT EXISTS contributions (
    seq INTEGER PRIMARY KEY,
    canonical_id BLOB NOT NULL CHECK (length(canonical_id) = 16),
    source_system TEXT NOT NULL,
    native_id TEXT NOT NULL,
    received_at INTEGER NOT NULL,
    UNIQUE (canonical_id, source_system, native_id, received_at)
);

CREATE TABLE IF NOT EXISTS materialized_views (
    canonical_id BLOB PRIMARY KEY CHECK (length(canonical_id) = 16),
    model_type TEXT NOT NULL,
    version INTEGER NOT NULL,
    view BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS projections (
    view_name TEXT NOT NULL,
    canonical_id BLOB NOT NULL CHECK (length(canonical_id) = 16),
    model_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    content_hash BLOB NOT NULL CHECK (length(content_hash) = 32),
    version INTEGER NOT NULL,
    built_at INTEGER NOT NULL,
    PRIMARY KEY (view_name, canonical_id)
);

CREATE TABLE IF NOT EXISTS materialization_tasks (
    seq INTEGER PRIMARY KEY,
    canonical_id BLOB NOT NULL CHECK (length(canonical_id) = 16),
    version INTEGER NOT NULL,
    enqueued_at INTEGER NOT NULL,
    in_flight INTEGER NOT NULL DEFAULT 0,
    UNIQUE (canonical_id, version)
);
";
