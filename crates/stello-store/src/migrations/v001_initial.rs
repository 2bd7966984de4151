//! v001 -- Initial schema creation.
//!
//! One generic `documents` table (the backend stores JSON bodies keyed by
//! collection + id) and a `meta` table persisting the monotonic clock and
//! commit counter across restarts.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    collection TEXT NOT NULL,
    id         TEXT NOT NULL,
    data       TEXT NOT NULL,               -- JSON document body
    commit_seq INTEGER NOT NULL,            -- last commit touching this row

    PRIMARY KEY (collection, id)
);

CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection);

CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY NOT NULL,
    value INTEGER NOT NULL
);

INSERT OR IGNORE INTO meta (key, value) VALUES ('last_timestamp_ms', 0);
INSERT OR IGNORE INTO meta (key, value) VALUES ('last_commit_seq', 0);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
