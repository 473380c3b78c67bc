//! Online database snapshots shipped to object storage.
//!
//! Uses `rusqlite::backup::Backup` so the store stays open and in use during
//! the copy. Snapshots land at `backups/<device>/<timestamp>.db`. Backups are
//! best-effort: a failure is logged and the next interval tries again.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;

use crate::db::{KioskDb, SharedDb};
use crate::object_store::{ObjectStore, ObjectStoreError};
use crate::types::BackupConfig;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("Snapshot failed: {0}")]
    Snapshot(#[from] rusqlite::Error),

    #[error("Snapshot file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Upload failed: {0}")]
    Upload(#[from] ObjectStoreError),
}

pub fn backup_key(device_id: &str, at: DateTime<Utc>) -> String {
    format!("backups/{}/{}.db", device_id, at.format("%Y%m%dT%H%M%SZ"))
}

/// Copy the live database into a fresh SQLite file at `dest`.
pub fn snapshot_to(db: &KioskDb, dest: &Path) -> Result<(), BackupError> {
    let mut backup_conn = rusqlite::Connection::open(dest)?;
    let backup = rusqlite::backup::Backup::new(db.conn_ref(), &mut backup_conn)?;
    // All pages in one step; kiosk stores stay small.
    backup.step(-1)?;
    Ok(())
}

/// Snapshot the store and upload it. Returns the object key.
pub async fn backup_to_store(db: &SharedDb, store: &dyn ObjectStore, now: DateTime<Utc>) -> Result<String, BackupError> {
    let snapshot = tempfile::NamedTempFile::new()?;
    let device_id = {
        let db = db.lock();
        snapshot_to(&db, snapshot.path())?;
        db.device_id().to_string()
    };

    let bytes = tokio::fs::read(snapshot.path()).await?;
    let key = backup_key(&device_id, now);
    let size = bytes.len();
    store.put(&key, bytes).await?;
    log::info!("Database backed up to {} ({} bytes)", key, size);
    Ok(key)
}

pub async fn run_backup_poller(
    db: SharedDb,
    store: Arc<dyn ObjectStore>,
    config: BackupConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = Duration::from_secs(config.interval_minutes.max(1) * 60);

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {},
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            },
        }

        if let Err(e) = backup_to_store(&db, store.as_ref(), Utc::now()).await {
            log::warn!("Backup poller: backup failed: {}", e);
        }
    }

    log::info!("Backup poller: stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;
    use crate::object_store::FsObjectStore;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn test_backup_key_layout() {
        let at = Utc.with_ymd_and_hms(2026, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(backup_key("kiosk-7", at), "backups/kiosk-7/20260309T070501Z.db");
    }

    #[tokio::test]
    async fn test_backup_uploads_a_readable_snapshot() {
        let db = test_db("dev-a").into_shared();
        db.lock().create_person("p1", &[1.0, 0.0], None, Utc::now()).unwrap();
        let objects = tempdir().unwrap();
        let store = FsObjectStore::new(objects.path());

        let key = backup_to_store(&db, &store, Utc::now()).await.unwrap();
        assert!(key.starts_with("backups/dev-a/"));
        assert_eq!(store.list("backups/dev-a/").await.unwrap().len(), 1);

        let restored = tempdir().unwrap();
        let path = restored.path().join("restored.db");
        std::fs::write(&path, store.get(&key).await.unwrap()).unwrap();
        let conn = rusqlite::Connection::open(&path).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM persons", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_upload_failure_is_reported() {
        let db = test_db("dev-a").into_shared();
        let objects = tempdir().unwrap();
        // A file where the backups directory should be makes the put fail.
        std::fs::write(objects.path().join("backups"), b"not a dir").unwrap();
        let store = FsObjectStore::new(objects.path());
        let err = backup_to_store(&db, &store, Utc::now()).await.unwrap_err();
        assert!(matches!(err, BackupError::Upload(_)));
    }
}
