//! SQLite-backed local store for persons, events, the media catalog and sync
//! bookkeeping.
//!
//! The database lives at `<dataDir>/adkiosk.db` (default `~/.adkiosk/adkiosk.db`).
//! One connection serves the whole process: it is wrapped in a
//! `parking_lot::Mutex` ([`SharedDb`]) so the detection path and the sync task
//! take turns as the single writer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection};

pub mod types;
pub use types::*;

pub mod events;
pub mod media;
pub mod people;
pub mod sync;

/// Shared handle to the store. Never hold the guard across an `.await`.
pub type SharedDb = Arc<Mutex<KioskDb>>;

pub struct KioskDb {
    conn: Connection,
    device_id: String,
}

impl KioskDb {
    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Identity of the device that owns this store. Every locally written
    /// synced row is stamped with it.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn into_shared(self) -> SharedDb {
        Arc::new(Mutex::new(self))
    }

    /// Execute a closure within a SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    ///
    /// Calls made while a transaction is already open join it instead of
    /// starting a nested one.
    pub fn with_transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Self) -> Result<T, E>,
        E: From<DbError>,
    {
        if !self.conn.is_autocommit() {
            return f(self);
        }
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| E::from(DbError::Sqlite(e)))?;
        match f(self) {
            Ok(val) => {
                self.conn
                    .execute_batch("COMMIT")
                    .map_err(|e| E::from(DbError::Sqlite(e)))?;
                Ok(val)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Open (or create) the database inside `data_dir`.
    pub fn open_in(data_dir: &Path, device_id: &str) -> Result<Self, DbError> {
        Self::open_at(data_dir.join("adkiosk.db"), device_id)
    }

    /// Open a database at an explicit path and apply pending migrations.
    pub fn open_at(path: PathBuf, device_id: &str) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        crate::migrations::run_migrations(&conn)?;

        conn.execute(
            "INSERT OR IGNORE INTO device_sequence (device_id, last_seq) VALUES (?1, 0)",
            params![device_id],
        )?;

        log::info!("Local store opened at {} for device {}", path.display(), device_id);

        Ok(Self {
            conn,
            device_id: device_id.to_string(),
        })
    }

    /// Default data directory: `~/.adkiosk`.
    pub fn default_data_dir() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
        Ok(home.join(".adkiosk"))
    }

    /// Path of the main database file, as SQLite reports it.
    pub fn path(&self) -> Option<PathBuf> {
        self.conn
            .path()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
    }

    /// Allocate the next local sequence number.
    ///
    /// One counter covers every synced table so `(device, seq)` is unique
    /// store-wide. Callers invoke this inside the transaction that writes the
    /// row; a rollback returns the number.
    pub fn next_seq(&self) -> Result<i64, DbError> {
        self.conn.execute(
            "UPDATE device_sequence SET last_seq = last_seq + 1 WHERE device_id = ?1",
            params![self.device_id],
        )?;
        self.current_seq()
    }

    pub fn current_seq(&self) -> Result<i64, DbError> {
        let seq = self.conn.query_row(
            "SELECT last_seq FROM device_sequence WHERE device_id = ?1",
            params![self.device_id],
            |row| row.get(0),
        )?;
        Ok(seq)
    }
}
