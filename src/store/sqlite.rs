//! Relational backend on SQLite
//!
//! Each backend instance owns one table, `<prefix>kv`, so several logical
//! stores can share a database file under different table prefixes. BLOB
//! keys compare with `memcmp`, which matches the byte order of every other
//! backend.

use crate::store::backend::{Durability, KvBackend, WriteBatch, WriteOp};
use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::{debug, info};

struct Inner {
    conn: Connection,
    /// `PRAGMA synchronous` level currently applied
    durability: Option<Durability>,
}

pub struct SqliteBackend {
    inner: Mutex<Inner>,
    table: String,
}

fn validate_prefix(prefix: &str) -> Result<()> {
    if prefix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !prefix.starts_with(|c: char| c.is_ascii_digit())
    {
        Ok(())
    } else {
        Err(Error::InvalidNamespace(format!(
            "table prefix '{}' must be ASCII letters, digits or '_'",
            prefix
        )))
    }
}

impl SqliteBackend {
    /// Open or create a database file and the table for `table_prefix`
    pub fn open(path: impl AsRef<Path>, table_prefix: &str) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        let backend = Self::with_connection(conn, table_prefix)?;
        info!(path = ?path.as_ref(), table = %backend.table, "opened sqlite store");
        Ok(backend)
    }

    /// In-memory database, mostly for tests
    pub fn in_memory(table_prefix: &str) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, table_prefix)
    }

    fn with_connection(conn: Connection, table_prefix: &str) -> Result<Self> {
        validate_prefix(table_prefix)?;
        let table = format!("{}kv", table_prefix);
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                k BLOB PRIMARY KEY,
                v BLOB NOT NULL
            ) WITHOUT ROWID;"
        ))?;
        Ok(SqliteBackend {
            inner: Mutex::new(Inner {
                conn,
                durability: None,
            }),
            table,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

impl KvBackend for SqliteBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.lock();
        let mut stmt = inner
            .conn
            .prepare_cached(&format!("SELECT v FROM {} WHERE k = ?1", self.table))?;
        Ok(stmt
            .query_row(params![key], |row| row.get::<_, Vec<u8>>(0))
            .optional()?)
    }

    fn last_in_range(&self, start: &[u8], end: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let inner = self.inner.lock();
        let mut stmt = inner.conn.prepare_cached(&format!(
            "SELECT k, v FROM {} WHERE k >= ?1 AND k < ?2 ORDER BY k DESC LIMIT 1",
            self.table
        ))?;
        Ok(stmt
            .query_row(params![start, end], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?)
    }

    fn scan_range(
        &self,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let inner = self.inner.lock();
        let mut stmt = inner.conn.prepare_cached(&format!(
            "SELECT k, v FROM {} WHERE k >= ?1 AND k < ?2 ORDER BY k ASC LIMIT ?3",
            self.table
        ))?;
        let rows = stmt
            .query_map(params![start, end, limit], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn write(&self, batch: WriteBatch, durability: Durability) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        if inner.durability != Some(durability) {
            let level = match durability {
                Durability::Sync => "FULL",
                Durability::Buffered => "NORMAL",
            };
            inner.conn.pragma_update(None, "synchronous", level)?;
            inner.durability = Some(durability);
        }

        let count = batch.len();
        let tx = inner.conn.transaction()?;
        {
            let mut put = tx.prepare_cached(&format!(
                "INSERT OR REPLACE INTO {} (k, v) VALUES (?1, ?2)",
                self.table
            ))?;
            let mut del = tx.prepare_cached(&format!("DELETE FROM {} WHERE k = ?1", self.table))?;
            for op in batch.ops() {
                match op {
                    WriteOp::Put { key, value } => {
                        put.execute(params![key, value])?;
                    }
                    WriteOp::Delete { key } => {
                        del.execute(params![key])?;
                    }
                }
            }
        }
        tx.commit()?;
        debug!(table = %self.table, ops = count, "sqlite batch committed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}
