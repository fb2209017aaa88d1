//! Checkpoints: reversible snapshots taken before risky operations
//!
//! A checkpoint is a gzip-compressed SQLCipher export of the store plus a JSON
//! sidecar with its metadata, both kept in the checkpoint directory:
//!
//! ```text
//! <dir>/<id>.db.gz   snapshot, encrypted with the store's key
//! <dir>/<id>.json    CheckpointInfo
//! ```
//!
//! Keeping the metadata outside the store means restoring a checkpoint can never
//! remove the record of that checkpoint. Restoring goes through
//! [`CheckpointManager::prepare_for_restore`], see [`RestoreGuard`].

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::db::{self, Database};
use crate::error::{Error, Result};

mod restore;

pub use restore::{RestoreGuard, RestoreRefused};

const SNAPSHOT_EXT: &str = "db.gz";
const SIDECAR_EXT: &str = "json";
const DEFAULT_KEEP_AUTO: usize = 10;

/// Metadata for one checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub id: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    /// Compressed snapshot size
    pub size_bytes: u64,
    pub transaction_count: i64,
    pub category_count: i64,
    #[serde(default)]
    pub classification_count: i64,
    pub is_auto: bool,
    /// SHA-256 of the uncompressed snapshot
    pub checksum: String,
    pub file_name: String,
    #[serde(default)]
    pub encrypted: bool,
}

/// Creates, lists, prunes and restores checkpoints in one directory
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    keep_auto: usize,
}

impl CheckpointManager {
    /// Use `dir`, creating it if needed
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| {
                Error::Checkpoint(format!(
                    "Failed to create checkpoint directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
            info!("Created checkpoint directory: {}", dir.display());
        }
        Ok(Self {
            dir,
            keep_auto: DEFAULT_KEEP_AUTO,
        })
    }

    /// `~/.local/share/tally/checkpoints` (platform equivalent elsewhere)
    pub fn default_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tally")
            .join("checkpoints")
    }

    /// How many automatic checkpoints survive pruning
    pub fn with_keep_auto(mut self, keep_auto: usize) -> Self {
        self.keep_auto = keep_auto;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot the store under `tag` (or a timestamped id)
    pub fn create(
        &self,
        db: &Database,
        tag: Option<&str>,
        description: &str,
    ) -> Result<CheckpointInfo> {
        let id = match tag {
            Some(tag) => {
                validate_id(tag)?;
                if self.sidecar_path(tag).exists() {
                    return Err(Error::Checkpoint(format!(
                        "Checkpoint '{}' already exists",
                        tag
                    )));
                }
                tag.to_string()
            }
            None => self.unique_id(&format!("checkpoint-{}", timestamp())),
        };
        self.create_with_id(db, &id, description, false)
    }

    /// Best-effort checkpoint before a risky command
    ///
    /// Failures are logged and reported as `None`. Old automatic checkpoints beyond
    /// the retention limit are pruned afterwards.
    pub fn auto_checkpoint(&self, db: &Database, label: &str) -> Option<CheckpointInfo> {
        let id = self.unique_id(&format!("auto-{}-{}", sanitize_label(label), timestamp()));
        let description = format!("Automatic checkpoint before {}", label);
        let created = match self.create_with_id(db, &id, &description, true) {
            Ok(info) => info,
            Err(e) => {
                warn!(label, error = %e, "Automatic checkpoint failed, continuing without one");
                return None;
            }
        };
        if let Err(e) = self.prune_auto() {
            warn!(error = %e, "Failed to prune automatic checkpoints");
        }
        Some(created)
    }

    /// All checkpoints, newest first
    pub fn list(&self) -> Result<Vec<CheckpointInfo>> {
        let mut checkpoints = Vec::new();
        if !self.dir.exists() {
            return Ok(checkpoints);
        }

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SIDECAR_EXT) {
                continue;
            }
            match read_sidecar(&path) {
                Ok(info) => checkpoints.push(info),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint metadata"),
            }
        }

        checkpoints.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(checkpoints)
    }

    pub fn info(&self, id: &str) -> Result<CheckpointInfo> {
        validate_id(id)?;
        let path = self.sidecar_path(id);
        if !path.exists() {
            return Err(Error::NotFound(format!("checkpoint '{}'", id)));
        }
        read_sidecar(&path)
    }

    /// Remove a checkpoint's snapshot and metadata (irreversible)
    pub fn delete(&self, id: &str) -> Result<()> {
        let info = self.info(id)?;
        let snapshot = self.dir.join(&info.file_name);
        if snapshot.exists() {
            fs::remove_file(&snapshot)?;
        }
        fs::remove_file(self.sidecar_path(id))?;
        info!(checkpoint = id, "Deleted checkpoint");
        Ok(())
    }

    /// Delete automatic checkpoints beyond `keep_auto`; returns how many went
    pub fn prune_auto(&self) -> Result<usize> {
        let autos: Vec<_> = self.list()?.into_iter().filter(|c| c.is_auto).collect();
        let mut deleted = 0;
        for checkpoint in autos.iter().skip(self.keep_auto) {
            if let Err(e) = self.delete(&checkpoint.id) {
                warn!("Failed to delete checkpoint {}: {}", checkpoint.id, e);
                continue;
            }
            deleted += 1;
        }
        if deleted > 0 {
            debug!(deleted, keep = self.keep_auto, "Pruned automatic checkpoints");
        }
        Ok(deleted)
    }

    /// Take exclusive ownership of the store for a restore
    ///
    /// Consumes the handle and refuses with [`Error::StoreInUse`] while other clones
    /// of it are alive or another restore holds the lock. A refusal hands the
    /// handle back in [`RestoreRefused`].
    pub fn prepare_for_restore(
        &self,
        db: Database,
    ) -> std::result::Result<RestoreGuard, RestoreRefused> {
        RestoreGuard::acquire(self.clone(), db)
    }

    fn create_with_id(
        &self,
        db: &Database,
        id: &str,
        description: &str,
        is_auto: bool,
    ) -> Result<CheckpointInfo> {
        let before = db.store_counts()?;

        let staging = tempfile::Builder::new()
            .prefix(".tally-snapshot-")
            .tempdir_in(&self.dir)?;
        let raw_path = staging.path().join("snapshot.db");
        db.export_snapshot(&raw_path)?;

        let after = db::snapshot_counts(&raw_path, db.derived_key())?;
        if after != before {
            return Err(Error::Checkpoint(format!(
                "Store changed while the snapshot was taken ({:?} -> {:?}); nothing was saved",
                before, after
            )));
        }

        let file_name = format!("{}.{}", id, SNAPSHOT_EXT);
        let snapshot_path = self.dir.join(&file_name);
        let partial_path = staging.path().join(&file_name);
        let checksum = compress_with_checksum(&raw_path, &partial_path)?;
        fs::rename(&partial_path, &snapshot_path)?;
        let size_bytes = fs::metadata(&snapshot_path)?.len();

        let info = CheckpointInfo {
            id: id.to_string(),
            description: description.to_string(),
            created_at: Utc::now(),
            size_bytes,
            transaction_count: after.transactions,
            category_count: after.categories,
            classification_count: after.classifications,
            is_auto,
            checksum,
            file_name,
            encrypted: db.is_encrypted(),
        };

        let sidecar_tmp = staging.path().join("meta.json");
        fs::write(&sidecar_tmp, serde_json::to_string_pretty(&info)?)?;
        if let Err(e) = fs::rename(&sidecar_tmp, self.sidecar_path(id)) {
            let _ = fs::remove_file(&snapshot_path);
            return Err(e.into());
        }

        info!(
            checkpoint = %info.id,
            transactions = info.transaction_count,
            size_bytes = info.size_bytes,
            auto = is_auto,
            "Created checkpoint"
        );
        Ok(info)
    }

    fn sidecar_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", id, SIDECAR_EXT))
    }

    pub(crate) fn snapshot_path(&self, info: &CheckpointInfo) -> PathBuf {
        self.dir.join(&info.file_name)
    }

    /// `base`, or `base-2`, `base-3`... when taken
    fn unique_id(&self, base: &str) -> String {
        let mut id = base.to_string();
        let mut n = 2;
        while self.sidecar_path(&id).exists() {
            id = format!("{}-{}", base, n);
            n += 1;
        }
        id
    }
}

fn timestamp() -> String {
    Utc::now().format("%Y%m%d-%H%M%S").to_string()
}

/// Checkpoint ids double as file names
fn validate_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidData(format!(
            "Invalid checkpoint tag '{}': use letters, digits, '-' and '_'",
            id
        )))
    }
}

fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('-');
    if cleaned.is_empty() {
        "op".to_string()
    } else {
        cleaned.to_string()
    }
}

fn read_sidecar(path: &Path) -> Result<CheckpointInfo> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Gzip `source` into `dest`, returning the SHA-256 of the uncompressed bytes
fn compress_with_checksum(source: &Path, dest: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(source)?);
    let writer = BufWriter::new(File::create(dest)?);
    let mut encoder = GzEncoder::new(writer, Compression::default());
    let mut hasher = Sha256::new();

    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
        encoder.write_all(&buffer[..bytes_read])?;
    }
    encoder.finish()?.flush()?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Classification, ClassificationStatus, Transaction};
    use chrono::NaiveDate;

    fn populated_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.seed_default_categories().unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        db.insert_transactions(&[
            Transaction::new("t1", date, "NETFLIX", 15.0),
            Transaction::new("t2", date, "SAFEWAY", 80.0),
        ])
        .unwrap();
        db.upsert_classification(&Classification::new(
            "t1",
            "Subscriptions",
            ClassificationStatus::ClassifiedByAi,
            0.97,
        ))
        .unwrap();
        db
    }

    #[test]
    fn test_create_list_info_delete() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path()).unwrap();
        let db = populated_db();

        let info = manager.create(&db, Some("before-import"), "manual").unwrap();
        assert_eq!(info.id, "before-import");
        assert_eq!(info.transaction_count, 2);
        assert_eq!(info.category_count, 17);
        assert_eq!(info.classification_count, 1);
        assert!(!info.is_auto);
        assert_eq!(info.checksum.len(), 64);
        assert!(dir.path().join("before-import.db.gz").exists());

        let generated = manager.create(&db, None, "second").unwrap();
        assert!(generated.id.starts_with("checkpoint-"));

        let listed = manager.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, generated.id);
        assert_eq!(manager.info("before-import").unwrap(), info);

        manager.delete("before-import").unwrap();
        assert!(matches!(
            manager.info("before-import"),
            Err(Error::NotFound(_))
        ));
        assert!(!dir.path().join("before-import.db.gz").exists());
    }

    #[test]
    fn test_tags_are_validated_and_unique() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path()).unwrap();
        let db = populated_db();

        assert!(manager.create(&db, Some("../escape"), "x").is_err());
        assert!(manager.create(&db, Some("has space"), "x").is_err());
        manager.create(&db, Some("v1"), "x").unwrap();
        assert!(matches!(
            manager.create(&db, Some("v1"), "x"),
            Err(Error::Checkpoint(_))
        ));
    }

    #[test]
    fn test_auto_checkpoints_are_pruned_but_manual_kept() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path()).unwrap().with_keep_auto(2);
        let db = populated_db();

        manager.create(&db, Some("keep-me"), "manual").unwrap();
        let mut autos = Vec::new();
        for _ in 0..4 {
            autos.push(manager.auto_checkpoint(&db, "classify batch").unwrap());
        }
        assert!(autos[0].id.starts_with("auto-classify-batch-"));
        assert!(autos.iter().all(|a| a.is_auto));

        let remaining = manager.list().unwrap();
        let auto_ids: Vec<_> = remaining
            .iter()
            .filter(|c| c.is_auto)
            .map(|c| c.id.clone())
            .collect();
        assert_eq!(auto_ids, vec![autos[3].id.clone(), autos[2].id.clone()]);
        assert!(remaining.iter().any(|c| c.id == "keep-me"));
    }

    #[test]
    fn test_auto_checkpoint_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().join("cp")).unwrap();
        fs::remove_dir_all(manager.dir()).unwrap();
        let db = populated_db();
        assert!(manager.auto_checkpoint(&db, "import").is_none());
    }

    #[test]
    fn test_sanitize_label() {
        assert_eq!(sanitize_label("Classify Batch"), "classify-batch");
        assert_eq!(sanitize_label("!!"), "op");
    }
}
