//! Database access layer with connection pooling and schema bootstrap
//!
//! This module is organized by domain:
//! - `transactions` - Imported bank transactions (read-mostly)
//! - `categories` - Category catalogue
//! - `classifications` - One classification row per transaction
//! - `vendor_rules` - Learned merchant → category rules
//! - `check_patterns` - Paper-check rules
//! - `pattern_rules` - General conditional rules
//! - `analysis` - Analysis sessions and issues
//! - `snapshot` - SQLCipher export used by checkpoints

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use tracing::{debug, info};

use crate::error::{Error, Result};

mod analysis;
mod categories;
mod check_patterns;
mod classifications;
mod pattern_rules;
mod restore_lock;
mod snapshot;
mod transactions;
mod vendor_rules;

pub use classifications::ClassifiedTransaction;
pub use snapshot::StoreCounts;
pub(crate) use analysis::{get_issue_with, mark_issue_fixed_with};
pub(crate) use classifications::upsert_classification_with;
pub(crate) use pattern_rules::{find_pattern_rule_with, insert_pattern_rule_with};
pub(crate) use restore_lock::{lock_path as restore_lock_path, RestoreLock};
pub(crate) use snapshot::{snapshot_counts, verify_snapshot};
pub(crate) use vendor_rules::insert_vendor_rule_if_absent_with;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConn = PooledConnection<SqliteConnectionManager>;

/// Environment variable for database encryption key
pub const DB_KEY_ENV: &str = "TALLY_DB_KEY";

/// How long a writer waits on a locked store before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Derive an encryption key from a passphrase using Argon2
///
/// Uses a fixed application salt so the same passphrase always produces the same key,
/// regardless of database path. Checkpoints restored from another path stay readable.
fn derive_key(passphrase: &str) -> Result<String> {
    use argon2::{password_hash::SaltString, Argon2, PasswordHasher};

    // Changing this would invalidate all existing encrypted stores
    const APP_SALT: &[u8; 16] = b"tally-salt-v1-ok";

    let salt = SaltString::encode_b64(APP_SALT)
        .map_err(|e| Error::Encryption(format!("Failed to create salt: {}", e)))?;

    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(passphrase.as_bytes(), &salt)
        .map_err(|e| Error::Encryption(format!("Failed to derive key: {}", e)))?;

    let hash_str = hash
        .hash
        .ok_or_else(|| Error::Encryption("No hash output".to_string()))?;
    Ok(hex::encode(hash_str.as_bytes()))
}

/// Parse a SQLite datetime string into a DateTime<Utc>
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    // SQLite stores as "YYYY-MM-DD HH:MM:SS" format
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|dt| dt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

/// Format a timestamp the way SQLite's CURRENT_TIMESTAMP does
pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

pub(crate) fn parse_date(s: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Map a stored enum string back through its `FromStr`
pub(crate) fn parse_enum<T>(idx: usize, s: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    s.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(Error::InvalidData(e)),
        )
    })
}

/// Database wrapper with connection pooling
///
/// Cloning is cheap; every clone shares the pool. Restoring a checkpoint needs the
/// last remaining handle, see [`crate::checkpoint::CheckpointManager::prepare_for_restore`].
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
    /// Path to the database file
    db_path: PathBuf,
    /// Derived SQLCipher key, if encrypted
    key: Option<String>,
    /// Live-handle counter
    handle: Arc<()>,
}

impl Database {
    /// Open the store with encryption
    ///
    /// Requires `TALLY_DB_KEY` to be set. Use `new_unencrypted()` for development.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let encryption_key = std::env::var(DB_KEY_ENV).ok();
        match encryption_key {
            Some(key) => Self::new_with_key(path, Some(&key)),
            None => Err(Error::Encryption(format!(
                "Database encryption required. Set {} environment variable with your passphrase, \
                or use --no-encrypt for unencrypted databases (not recommended for production).",
                DB_KEY_ENV
            ))),
        }
    }

    /// Open an unencrypted store
    pub fn new_unencrypted(path: impl AsRef<Path>) -> Result<Self> {
        Self::new_with_key(path, None)
    }

    /// Open the store with an explicit passphrase
    pub fn new_with_key(path: impl AsRef<Path>, passphrase: Option<&str>) -> Result<Self> {
        let key = passphrase.map(derive_key).transpose()?;
        Self::open_with_derived_key(path.as_ref(), key)
    }

    pub(crate) fn open_with_derived_key(path: &Path, key: Option<String>) -> Result<Self> {
        restore_lock::ensure_unlocked(path)?;

        let key_pragma = key
            .as_ref()
            .map(|k| format!("PRAGMA key = 'x\"{}\"';", k));

        // Set the key (if any) and per-connection pragmas on every new connection
        let manager = SqliteConnectionManager::file(path).with_init(move |conn| {
            if let Some(pragma) = &key_pragma {
                conn.execute_batch(pragma)?;
            }
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            Ok(())
        });

        let pool = Pool::builder().max_size(10).build(manager)?;

        let db = Self {
            pool,
            db_path: path.to_path_buf(),
            key,
            handle: Arc::new(()),
        };
        db.run_migrations()?;

        Ok(db)
    }

    /// Create a throwaway store (for testing)
    ///
    /// Uses a temporary file rather than `:memory:` because SQLCipher
    /// has issues with in-memory databases in the connection pool.
    pub fn in_memory() -> Result<Self> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!(
            "tally_test_{}_{}.db",
            std::process::id(),
            id
        ));

        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", path.display(), suffix));
        }

        Self::new_unencrypted(&path)
    }

    /// Get the path to the database file
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn is_encrypted(&self) -> bool {
        self.key.is_some()
    }

    pub(crate) fn derived_key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Number of live clones of this handle, including this one
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.handle)
    }

    /// Get a connection from the pool
    ///
    /// Fails with [`Error::StoreInUse`] while another process restores the store.
    pub fn conn(&self) -> Result<DbConn> {
        restore_lock::ensure_unlocked(&self.db_path)?;
        Ok(self.pool.get()?)
    }

    /// Flush the WAL into the main file
    ///
    /// Bypasses the restore lock: the restoring process calls this itself.
    pub(crate) fn checkpoint_wal(&self) -> Result<()> {
        let conn = self.pool.get()?;
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE);", [], |_| Ok(()))?;
        debug!(path = %self.db_path.display(), "WAL checkpointed");
        Ok(())
    }

    /// Run the idempotent schema bootstrap
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            -- WAL mode: readers don't block the single writer
            -- Note: creates -wal and -shm sidecar files alongside the database
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;

            -- Transactions (delivered by import adapters, never mutated here)
            CREATE TABLE IF NOT EXISTS transactions (
                id TEXT PRIMARY KEY,
                date DATE NOT NULL,
                name TEXT NOT NULL,
                merchant_name TEXT NOT NULL DEFAULT '',
                amount REAL NOT NULL CHECK (amount >= 0),
                direction TEXT,                            -- income, expense, transfer
                account_id TEXT NOT NULL DEFAULT '',
                check_number TEXT,
                provider_category TEXT,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_transactions_date ON transactions(date, id);
            CREATE INDEX IF NOT EXISTS idx_transactions_merchant ON transactions(merchant_name);

            -- Categories
            CREATE TABLE IF NOT EXISTS categories (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE COLLATE NOCASE,
                description TEXT,
                active BOOLEAN NOT NULL DEFAULT 1,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            -- Classifications (at most one per transaction)
            CREATE TABLE IF NOT EXISTS classifications (
                transaction_id TEXT PRIMARY KEY REFERENCES transactions(id) ON DELETE CASCADE,
                category TEXT NOT NULL,
                status TEXT NOT NULL,                      -- unclassified, classified_by_rule, classified_by_ai, user_modified
                confidence REAL NOT NULL,
                classified_at DATETIME NOT NULL,
                notes TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_classifications_category ON classifications(category);
            CREATE INDEX IF NOT EXISTS idx_classifications_status ON classifications(status);

            -- Vendor rules (merchant → category)
            CREATE TABLE IF NOT EXISTS vendor_rules (
                id INTEGER PRIMARY KEY,
                merchant TEXT NOT NULL UNIQUE COLLATE NOCASE,
                is_regex BOOLEAN NOT NULL DEFAULT 0,
                category TEXT NOT NULL,
                source TEXT NOT NULL,                      -- manual, auto, auto_confirmed
                use_count INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                last_updated DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            -- Check patterns (paper checks)
            CREATE TABLE IF NOT EXISTS check_patterns (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                amount TEXT NOT NULL,                      -- JSON: exact | range | list
                day_min INTEGER,
                day_max INTEGER,
                category TEXT NOT NULL,
                confidence_boost REAL NOT NULL DEFAULT 0,
                use_count INTEGER NOT NULL DEFAULT 0,
                state TEXT NOT NULL DEFAULT 'active',
                notes TEXT,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_check_patterns_state ON check_patterns(state);

            -- Pattern rules (generic conditional rules)
            CREATE TABLE IF NOT EXISTS pattern_rules (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                merchant_kind TEXT,                        -- exact, regex, or NULL for any merchant
                merchant_pattern TEXT,
                amount_op TEXT NOT NULL DEFAULT 'any',     -- any, lt, le, eq, ge, gt, range
                amount_value REAL,
                amount_min REAL,
                amount_max REAL,
                direction TEXT,
                category TEXT NOT NULL,
                confidence REAL NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                state TEXT NOT NULL DEFAULT 'active',
                use_count INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_pattern_rules_state ON pattern_rules(state, priority DESC);

            -- Analysis sessions (resumable)
            CREATE TABLE IF NOT EXISTS analysis_sessions (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL DEFAULT 'pending',    -- pending, in_progress, completed, failed
                start_date DATE,
                end_date DATE,
                issues_found INTEGER NOT NULL DEFAULT 0,
                issues_fixed INTEGER NOT NULL DEFAULT 0,
                coherence_score REAL,
                error TEXT,
                started_at DATETIME NOT NULL,
                completed_at DATETIME,
                last_activity DATETIME NOT NULL
            );

            -- Analysis issues
            CREATE TABLE IF NOT EXISTS analysis_issues (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES analysis_sessions(id) ON DELETE CASCADE,
                issue_type TEXT NOT NULL,                  -- inconsistent, misclassified, missing_pattern
                severity TEXT NOT NULL,
                description TEXT NOT NULL,
                transaction_ids TEXT NOT NULL,             -- JSON array
                current_category TEXT,
                suggested_category TEXT,
                confidence REAL NOT NULL,
                fix TEXT,                                  -- JSON Fix
                status TEXT NOT NULL DEFAULT 'pending',    -- pending, fixed, dismissed, failed
                fixed_at DATETIME,
                error TEXT,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_analysis_issues_session ON analysis_issues(session_id, status);
            "#,
        )?;

        info!("Database schema initialized");
        Ok(())
    }
}
