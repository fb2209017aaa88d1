//! Two-phase restore
//!
//! 1. [`CheckpointManager::prepare_for_restore`] takes the last live `Database`
//!    handle, flushes the WAL, closes the pool and takes a lock file.
//! 2. [`RestoreGuard::restore`] decompresses the snapshot next to the store,
//!    verifies checksum and integrity, then renames it over the store.
//! 3. [`RestoreGuard::reopen`] releases the lock and hands back a fresh handle.
//!
//! Everything before the final rename works on a staging copy, so any failure
//! leaves the live store exactly as it was.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::{CheckpointInfo, CheckpointManager};
use crate::db::{self, Database, RestoreLock};
use crate::error::{Error, Result};

/// A refused [`CheckpointManager::prepare_for_restore`], with the handle given back
#[derive(thiserror::Error)]
#[error("{error}")]
pub struct RestoreRefused {
    pub error: Error,
    pub db: Database,
}

impl fmt::Debug for RestoreRefused {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestoreRefused")
            .field("error", &self.error)
            .field("db", &self.db.path())
            .finish()
    }
}

impl From<RestoreRefused> for Error {
    fn from(refused: RestoreRefused) -> Self {
        refused.error
    }
}

/// Exclusive access to a closed store, ready to be overwritten by a checkpoint
pub struct RestoreGuard {
    manager: CheckpointManager,
    db_path: PathBuf,
    key: Option<String>,
    lock: RestoreLock,
}

impl fmt::Debug for RestoreGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestoreGuard")
            .field("manager", &self.manager)
            .field("db_path", &self.db_path)
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}

impl RestoreGuard {
    pub(super) fn acquire(
        manager: CheckpointManager,
        db: Database,
    ) -> std::result::Result<Self, RestoreRefused> {
        let handles = db.handle_count();
        if handles > 1 {
            let error = Error::StoreInUse(format!(
                "{} other handle(s) to {} are still open",
                handles - 1,
                db.path().display()
            ));
            return Err(RestoreRefused { error, db });
        }

        let lock = match RestoreLock::acquire(db.path()) {
            Ok(lock) => lock,
            Err(error) => return Err(RestoreRefused { error, db }),
        };
        if let Err(error) = db.checkpoint_wal() {
            drop(lock);
            return Err(RestoreRefused { error, db });
        }

        let db_path = db.path().to_path_buf();
        let key = db.derived_key().map(String::from);
        drop(db);
        debug!(path = %db_path.display(), "Store closed for restore");

        Ok(Self {
            manager,
            db_path,
            key,
            lock,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Replace the store with checkpoint `id`
    ///
    /// Fails with [`Error::Restore`] (store untouched) when the checkpoint is
    /// missing, corrupt, or encrypted with a different key.
    pub fn restore(&self, id: &str) -> Result<CheckpointInfo> {
        let info = self
            .manager
            .info(id)
            .map_err(|e| Error::Restore(e.to_string()))?;
        let staging = self
            .stage(&info)
            .map_err(|e| match e {
                Error::Restore(_) => e,
                other => Error::Restore(other.to_string()),
            })?;

        for suffix in ["-wal", "-shm"] {
            let path = sidecar_raw(&self.db_path, suffix);
            if path.exists() {
                fs::remove_file(&path).map_err(|e| {
                    Error::Restore(format!("could not remove {}: {}", path.display(), e))
                })?;
            }
        }

        staging
            .persist(&self.db_path)
            .map_err(|e| Error::Restore(format!("could not replace store: {}", e.error)))?;

        info!(
            checkpoint = %info.id,
            transactions = info.transaction_count,
            path = %self.db_path.display(),
            "Restored checkpoint"
        );
        Ok(info)
    }

    /// Release the lock and open the (restored) store again
    pub fn reopen(mut self) -> Result<Database> {
        self.lock.release();
        Database::open_with_derived_key(&self.db_path, self.key.clone())
    }

    /// Decompress, checksum and integrity-check the snapshot in a temp file
    fn stage(&self, info: &CheckpointInfo) -> Result<tempfile::NamedTempFile> {
        let source = self.manager.snapshot_path(info);
        if !source.exists() {
            return Err(Error::Restore(format!(
                "snapshot file {} is missing",
                source.display()
            )));
        }
        let parent = self
            .db_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let staging = tempfile::Builder::new()
            .prefix(".tally-restore-")
            .tempfile_in(parent)?;

        let mut decoder = GzDecoder::new(BufReader::new(File::open(&source)?));
        let mut writer = BufWriter::new(staging.as_file());
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 8192];
        loop {
            let bytes_read = decoder.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
            writer.write_all(&buffer[..bytes_read])?;
        }
        writer.flush()?;
        drop(writer);

        let checksum = hex::encode(hasher.finalize());
        if checksum != info.checksum {
            return Err(Error::Restore(format!(
                "checksum mismatch for '{}' (expected {}, got {})",
                info.id, info.checksum, checksum
            )));
        }

        db::verify_snapshot(staging.path(), self.key.as_deref())?;
        debug!(checkpoint = %info.id, "Snapshot verified");
        Ok(staging)
    }
}

fn sidecar_raw(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Classification, ClassificationStatus, Transaction};
    use chrono::NaiveDate;

    fn tx(id: &str) -> Transaction {
        Transaction::new(id, NaiveDate::from_ymd_opt(2024, 2, 2).unwrap(), "SHOP", 10.0)
    }

    #[test]
    fn test_round_trip_restores_rows() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().join("checkpoints")).unwrap();
        let db = Database::new_unencrypted(dir.path().join("store.db")).unwrap();
        db.insert_transactions(&[tx("a"), tx("b")]).unwrap();
        db.upsert_classification(&Classification::new(
            "a",
            "Shopping",
            ClassificationStatus::ClassifiedByRule,
            0.9,
        ))
        .unwrap();
        let before = db.list_classifications().unwrap();
        let info = manager.create(&db, Some("safe"), "before mess").unwrap();

        db.insert_transaction(&tx("c")).unwrap();
        db.upsert_classification(&Classification::new(
            "a",
            "Other",
            ClassificationStatus::UserModified,
            1.0,
        ))
        .unwrap();

        let guard = manager.prepare_for_restore(db).unwrap();
        let restored = guard.restore("safe").unwrap();
        assert_eq!(restored, info);
        let db = guard.reopen().unwrap();

        assert_eq!(db.count_transactions().unwrap(), 2);
        let after = db.list_classifications().unwrap();
        assert_eq!(after.len(), before.len());
        assert_eq!(after[0].category, "Shopping");
        assert_eq!(after[0].status, ClassificationStatus::ClassifiedByRule);
        assert!(!db::restore_lock_path(db.path()).exists());
    }

    #[test]
    fn test_encrypted_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().join("checkpoints")).unwrap();
        let path = dir.path().join("secret.db");
        let db = Database::new_with_key(&path, Some("correct horse")).unwrap();
        db.insert_transaction(&tx("a")).unwrap();
        let info = manager.create(&db, Some("enc"), "").unwrap();
        assert!(info.encrypted);
        db.insert_transaction(&tx("b")).unwrap();

        let guard = manager.prepare_for_restore(db).unwrap();
        guard.restore("enc").unwrap();
        let db = guard.reopen().unwrap();
        assert_eq!(db.count_transactions().unwrap(), 1);
    }

    #[test]
    fn test_refuses_while_other_handles_alive() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().join("checkpoints")).unwrap();
        let db = Database::new_unencrypted(dir.path().join("store.db")).unwrap();
        let _other = db.clone();
        let refused = manager.prepare_for_restore(db).unwrap_err();
        assert!(matches!(refused.error, Error::StoreInUse(_)));

        // The handle comes back usable and no lock is left behind
        assert_eq!(refused.db.count_transactions().unwrap(), 0);
        assert!(!db::restore_lock_path(refused.db.path()).exists());
    }

    #[test]
    fn test_corrupt_checkpoint_leaves_store_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().join("checkpoints")).unwrap();
        let db = Database::new_unencrypted(dir.path().join("store.db")).unwrap();
        db.insert_transaction(&tx("a")).unwrap();
        let mut info = manager.create(&db, Some("bad"), "").unwrap();
        db.insert_transaction(&tx("b")).unwrap();

        // Tamper with the recorded checksum
        info.checksum = "0".repeat(64);
        fs::write(
            manager.dir().join("bad.json"),
            serde_json::to_string(&info).unwrap(),
        )
        .unwrap();

        let guard = manager.prepare_for_restore(db).unwrap();
        let err = guard.restore("bad").unwrap_err();
        assert!(err.to_string().contains("no data was modified"));
        assert!(matches!(guard.restore("missing"), Err(Error::Restore(_))));

        let db = guard.reopen().unwrap();
        assert_eq!(db.count_transactions().unwrap(), 2);
    }

    #[test]
    fn test_store_is_locked_out_during_restore() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().join("checkpoints")).unwrap();
        let path = dir.path().join("store.db");
        let db = Database::new_unencrypted(&path).unwrap();
        let guard = manager.prepare_for_restore(db).unwrap();

        assert!(matches!(
            Database::new_unencrypted(&path),
            Err(Error::StoreInUse(_))
        ));

        drop(guard);
        let again = Database::new_unencrypted(&path).unwrap();
        assert!(manager.prepare_for_restore(again).is_ok());
    }

    #[test]
    fn test_open_handle_stops_writing_once_locked() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().join("checkpoints")).unwrap();
        let path = dir.path().join("store.db");
        let restoring = Database::new_unencrypted(&path).unwrap();
        // Stands in for another process that opened the store earlier
        let elsewhere = Database::new_unencrypted(&path).unwrap();

        let guard = manager.prepare_for_restore(restoring).unwrap();
        assert!(matches!(
            elsewhere.insert_transaction(&tx("late")),
            Err(Error::StoreInUse(_))
        ));

        let db = guard.reopen().unwrap();
        assert_eq!(db.count_transactions().unwrap(), 0);
        assert!(elsewhere.insert_transaction(&tx("after")).is_ok());
    }

    #[test]
    fn test_lock_conflict_returns_handle() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().join("checkpoints")).unwrap();
        let path = dir.path().join("store.db");
        let first = Database::new_unencrypted(&path).unwrap();
        let second = Database::new_unencrypted(&path).unwrap();
        let guard = manager.prepare_for_restore(first).unwrap();

        let refused = manager.prepare_for_restore(second).unwrap_err();
        assert!(matches!(refused.error, Error::StoreInUse(_)));
        drop(guard);
        assert_eq!(refused.db.count_transactions().unwrap(), 0);
    }

    #[test]
    fn test_stale_lock_from_crashed_restore_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().join("checkpoints")).unwrap();
        let path = dir.path().join("store.db");
        let db = Database::new_unencrypted(&path).unwrap();
        db.insert_transaction(&tx("a")).unwrap();
        manager.create(&db, Some("cp"), "").unwrap();
        drop(db);

        // Left behind by a process that no longer exists
        fs::write(db::restore_lock_path(&path), "0").unwrap();

        let db = Database::new_unencrypted(&path).unwrap();
        let guard = manager.prepare_for_restore(db).unwrap();
        guard.restore("cp").unwrap();
        let db = guard.reopen().unwrap();
        assert_eq!(db.count_transactions().unwrap(), 1);
    }
}
