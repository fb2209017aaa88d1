//! Consistent store export using SQLCipher export
//!
//! `sqlcipher_export()` copies every schema object and row into an attached
//! database and works while the store is in use.

use std::path::Path;

use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Database;
use crate::error::{Error, Result};

/// Row counts used to detect a store that changed mid-snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCounts {
    pub transactions: i64,
    pub categories: i64,
    pub classifications: i64,
}

impl StoreCounts {
    fn read(conn: &Connection) -> rusqlite::Result<Self> {
        conn.query_row(
            "SELECT (SELECT COUNT(*) FROM transactions),
                    (SELECT COUNT(*) FROM categories),
                    (SELECT COUNT(*) FROM classifications)",
            [],
            |row| {
                Ok(Self {
                    transactions: row.get(0)?,
                    categories: row.get(1)?,
                    classifications: row.get(2)?,
                })
            },
        )
    }
}

impl Database {
    pub fn store_counts(&self) -> Result<StoreCounts> {
        let conn = self.conn()?;
        Ok(StoreCounts::read(&conn)?)
    }

    /// Export the whole store into `target`, encrypted with the same key
    pub(crate) fn export_snapshot(&self, target: &Path) -> Result<()> {
        let conn = self.conn()?;

        let attach_sql = format!(
            "ATTACH DATABASE '{}' AS snapshot KEY '{}';",
            sql_path(target),
            self.derived_key()
                .map(|k| format!("x\"{}\"", k))
                .unwrap_or_default()
        );
        conn.execute_batch(&attach_sql)
            .map_err(|e| Error::Checkpoint(format!("Failed to attach snapshot database: {}", e)))?;

        // sqlcipher_export returns a result, so use query_row
        let exported = conn
            .query_row("SELECT sqlcipher_export('snapshot');", [], |_row| Ok(()))
            .map_err(|e| Error::Checkpoint(format!("sqlcipher_export failed: {}", e)));

        // Detach even when the export failed so the pooled connection stays clean
        let detached = conn
            .execute_batch("DETACH DATABASE snapshot;")
            .map_err(|e| Error::Checkpoint(format!("Failed to detach snapshot database: {}", e)));

        exported?;
        detached?;
        debug!(target = %target.display(), "Exported store snapshot");
        Ok(())
    }
}

/// Open a snapshot file directly with the given derived key
pub(crate) fn open_snapshot(path: &Path, key: Option<&str>) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    if let Some(key) = key {
        conn.execute_batch(&format!("PRAGMA key = 'x\"{}\"';", key))?;
    }
    Ok(conn)
}

/// Counts as seen inside a snapshot file
pub(crate) fn snapshot_counts(path: &Path, key: Option<&str>) -> Result<StoreCounts> {
    let conn = open_snapshot(path, key)?;
    Ok(StoreCounts::read(&conn)?)
}

/// `PRAGMA quick_check` on a snapshot file
pub(crate) fn verify_snapshot(path: &Path, key: Option<&str>) -> Result<()> {
    let conn = open_snapshot(path, key)?;
    let result: String = conn.query_row("PRAGMA quick_check;", [], |row| row.get(0))?;
    if result != "ok" {
        return Err(Error::Restore(format!("integrity check failed: {}", result)));
    }
    Ok(())
}

fn sql_path(path: &Path) -> String {
    path.display().to_string().replace('\'', "''")
}
