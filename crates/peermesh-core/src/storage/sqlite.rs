//! SQLite-backed store.
//!
//! One `kv` table for the logical key space and one `blobs` table for
//! received files. The connection sits behind a mutex; every operation is
//! a single statement, so the lock is never held across I/O boundaries
//! the caller can observe.

use super::{BlobMeta, Store};
use crate::error::Result;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

/// Durable [`Store`] implementation over SQLite.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open an in-memory database (tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                 key   TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS blobs (
                 tid         TEXT PRIMARY KEY,
                 name        TEXT NOT NULL,
                 size        INTEGER NOT NULL,
                 received_at INTEGER NOT NULL,
                 bytes       BLOB NOT NULL
             );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Store for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock();
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn put_blob(&self, tid: &str, meta: &BlobMeta, bytes: &[u8]) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO blobs (tid, name, size, received_at, bytes)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(tid) DO UPDATE SET
                 name = excluded.name,
                 size = excluded.size,
                 received_at = excluded.received_at,
                 bytes = excluded.bytes",
            params![tid, meta.name, meta.size as i64, meta.received_at, bytes],
        )?;
        Ok(())
    }

    fn get_blob(&self, tid: &str) -> Result<Option<(BlobMeta, Vec<u8>)>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT name, size, received_at, bytes FROM blobs WHERE tid = ?1",
                params![tid],
                |row| {
                    Ok((
                        BlobMeta {
                            name: row.get(0)?,
                            size: row.get::<_, i64>(1)? as u64,
                            received_at: row.get(2)?,
                        },
                        row.get::<_, Vec<u8>>(3)?,
                    ))
                },
            )
            .optional()?;
        Ok(row)
    }

    fn delete_blob(&self, tid: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute("DELETE FROM blobs WHERE tid = ?1", params![tid])?;
        Ok(())
    }
}
