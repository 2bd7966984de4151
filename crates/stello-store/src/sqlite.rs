//! Durable SQLite-backed document backend.
//!
//! Documents are JSON bodies in a single `documents` table; the monotonic
//! clock and commit counter persist in `meta`, so server timestamps stay
//! strictly increasing across restarts.  Filters are evaluated in Rust with
//! the same [`Filter::matches`] the in-memory backend uses.
//!
//! The connection sits behind a mutex and every operation is a short
//! synchronous transaction, mirroring how the rest of the workspace uses
//! rusqlite.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use directories::ProjectDirs;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tokio::sync::broadcast;

use stello_shared::constants::CHANGE_FEED_CAPACITY;

use crate::backend::{merge_into, Backend, ChangeEvent, Filter, WriteBatch, WriteOp};
use crate::error::{Result, StoreError};
use crate::migrations;

/// Document backend on top of a local SQLite database.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
    feed: broadcast::Sender<ChangeEvent>,
}

fn unavailable(e: rusqlite::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

impl SqliteBackend {
    /// Open (or create) the default application database.
    ///
    /// The database file is placed in the platform-appropriate data
    /// directory, e.g. `~/.local/share/stelloscope/stelloscope.db` on Linux.
    pub fn new() -> Result<Self> {
        let project_dirs = ProjectDirs::from("com", "stelloscope", "stelloscope")
            .ok_or_else(|| StoreError::Unavailable("no data directory".to_string()))?;

        let data_dir = project_dirs.data_dir();
        std::fs::create_dir_all(data_dir)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let db_path = data_dir.join("stelloscope.db");
        tracing::info!(path = %db_path.display(), "opening database");

        Self::open_at(&db_path)
    }

    /// Open (or create) a database at an explicit path.  Used by tests and
    /// embedded deployments with custom layouts.
    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(unavailable)?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(unavailable)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(unavailable)?;

        migrations::run_migrations(&conn)?;

        let (feed, _rx) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Ok(Self {
            conn: Mutex::new(conn),
            feed,
        })
    }

    /// Filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn
            .lock()
            .expect("connection lock poisoned")
            .path()
            .map(PathBuf::from)
    }

    fn read_meta(conn: &Connection, key: &str) -> Result<i64> {
        conn.query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .map_err(unavailable)
    }

    fn write_meta(conn: &Connection, key: &str, value: i64) -> Result<()> {
        conn.execute(
            "UPDATE meta SET value = ?1 WHERE key = ?2",
            params![value, key],
        )
        .map_err(unavailable)?;
        Ok(())
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn fetch(&self, collection: &'static str, id: &str) -> Result<Option<Value>> {
        let conn = self.conn.lock().expect("connection lock poisoned");
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                |row| row.get(0),
            )
            .optional()
            .map_err(unavailable)?;

        data.map(|s| serde_json::from_str(&s).map_err(StoreError::from))
            .transpose()
    }

    async fn query(&self, collection: &'static str, filter: &Filter) -> Result<Vec<Value>> {
        let conn = self.conn.lock().expect("connection lock poisoned");
        let mut stmt = conn
            .prepare("SELECT data FROM documents WHERE collection = ?1 ORDER BY id")
            .map_err(unavailable)?;

        let rows = stmt
            .query_map(params![collection], |row| row.get::<_, String>(0))
            .map_err(unavailable)?;

        let mut docs = Vec::new();
        for row in rows {
            let doc: Value = serde_json::from_str(&row.map_err(unavailable)?)?;
            if filter.matches(&doc) {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        let events = {
            let mut conn = self.conn.lock().expect("connection lock poisoned");
            let tx = conn.transaction().map_err(unavailable)?;

            let mut commit_seq = Self::read_meta(&tx, "last_commit_seq")? as u64;
            let mut events = Vec::with_capacity(batch.len());

            for op in batch.into_ops() {
                commit_seq += 1;
                match op {
                    WriteOp::Put {
                        collection,
                        id,
                        data,
                    } => {
                        tx.execute(
                            "INSERT OR REPLACE INTO documents (collection, id, data, commit_seq)
                             VALUES (?1, ?2, ?3, ?4)",
                            params![collection, id, data.to_string(), commit_seq as i64],
                        )
                        .map_err(unavailable)?;
                        events.push(ChangeEvent {
                            commit_seq,
                            collection,
                            id,
                            data,
                        });
                    }
                    WriteOp::Merge {
                        collection,
                        id,
                        patch,
                    } => {
                        let existing: Option<String> = tx
                            .query_row(
                                "SELECT data FROM documents
                                 WHERE collection = ?1 AND id = ?2",
                                params![collection, id],
                                |row| row.get(0),
                            )
                            .optional()
                            .map_err(unavailable)?;

                        let mut doc = match existing {
                            Some(s) => serde_json::from_str(&s)?,
                            None => Value::Object(Default::default()),
                        };
                        merge_into(&mut doc, &patch);

                        tx.execute(
                            "INSERT OR REPLACE INTO documents (collection, id, data, commit_seq)
                             VALUES (?1, ?2, ?3, ?4)",
                            params![collection, id, doc.to_string(), commit_seq as i64],
                        )
                        .map_err(unavailable)?;
                        events.push(ChangeEvent {
                            commit_seq,
                            collection,
                            id,
                            data: doc,
                        });
                    }
                    WriteOp::Delete { collection, id } => {
                        tx.execute(
                            "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
                            params![collection, id],
                        )
                        .map_err(unavailable)?;
                        events.push(ChangeEvent {
                            commit_seq,
                            collection,
                            id,
                            data: Value::Null,
                        });
                    }
                }
            }

            Self::write_meta(&tx, "last_commit_seq", commit_seq as i64)?;
            tx.commit().map_err(unavailable)?;
            events
        };

        for event in events {
            // No receivers is fine.
            let _ = self.feed.send(event);
        }
        Ok(())
    }

    async fn server_timestamp(&self) -> Result<DateTime<Utc>> {
        let mut conn = self.conn.lock().expect("connection lock poisoned");
        let tx = conn.transaction().map_err(unavailable)?;

        let last = Self::read_meta(&tx, "last_timestamp_ms")?;
        let next = Utc::now().timestamp_millis().max(last + 1);
        Self::write_meta(&tx, "last_timestamp_ms", next)?;
        tx.commit().map_err(unavailable)?;

        Ok(Utc
            .timestamp_millis_opt(next)
            .single()
            .unwrap_or_else(Utc::now))
    }

    fn watch(&self) -> broadcast::Receiver<ChangeEvent> {
        self.feed.subscribe()
    }
}
