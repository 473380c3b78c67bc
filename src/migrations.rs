//! Numbered schema migrations, embedded with `include_str!` and tracked in
//! `schema_version`.
//!
//! Each migration and its version row commit together. Before upgrading a
//! store that already holds data, a hot copy is written beside it as
//! `<db>.pre-migration.bak`.

use rusqlite::Connection;
use thiserror::Error;

struct Migration {
    version: i32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: include_str!("migrations/001_baseline.sql"),
}];

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("store is at schema v{found} but this build only knows up to v{known}; upgrade adkiosk first")]
    TooNew { found: i32, known: i32 },

    #[error("pre-migration snapshot failed: {0}")]
    Snapshot(rusqlite::Error),

    #[error("migration v{version} failed: {source}")]
    Apply { version: i32, source: rusqlite::Error },

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

fn schema_version(conn: &Connection) -> Result<i32, MigrationError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;
    let version = conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
        row.get(0)
    })?;
    Ok(version)
}

fn snapshot_before_upgrade(conn: &Connection, from: i32) -> Result<(), MigrationError> {
    let Some(path) = conn.path().filter(|p| !p.is_empty()) else {
        return Ok(());
    };
    let target = format!("{}.pre-migration.bak", path);
    let mut copy = Connection::open(&target).map_err(MigrationError::Snapshot)?;
    rusqlite::backup::Backup::new(conn, &mut copy)
        .and_then(|backup| backup.step(-1).map(|_| ()))
        .map_err(MigrationError::Snapshot)?;
    log::info!("Snapshot of schema v{} written to {}", from, target);
    Ok(())
}

/// Bring the schema up to date. Returns how many migrations ran.
///
/// A store written by a newer build is refused untouched.
pub fn run_migrations(conn: &Connection) -> Result<usize, MigrationError> {
    let current = schema_version(conn)?;
    let known = MIGRATIONS.last().map_or(0, |m| m.version);
    if current > known {
        return Err(MigrationError::TooNew { found: current, known });
    }

    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
    if pending.is_empty() {
        return Ok(0);
    }
    if current > 0 {
        snapshot_before_upgrade(conn, current)?;
    }

    for migration in &pending {
        let apply = |source| MigrationError::Apply {
            version: migration.version,
            source,
        };
        let tx = conn.unchecked_transaction().map_err(apply)?;
        tx.execute_batch(migration.sql).map_err(apply)?;
        tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [migration.version])
            .map_err(apply)?;
        tx.commit().map_err(apply)?;
        log::info!("Schema migrated to v{}", migration.version);
    }

    Ok(pending.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_store_gets_every_table() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(run_migrations(&conn).unwrap(), 1);
        assert_eq!(schema_version(&conn).unwrap(), 1);

        for table in [
            "persons",
            "identification_events",
            "advertisements",
            "display_events",
            "conflict_records",
            "sync_cursors",
            "sync_staging",
            "device_sequence",
        ] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
                .unwrap_or_else(|e| panic!("table {} missing: {}", table, e));
            assert_eq!(count, 0);
        }
    }

    #[test]
    fn test_unknown_display_outcome_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        let result = conn.execute(
            "INSERT INTO display_events (origin_device, seq, ad_id, age_bucket, gender,
             confidence, shown_at, outcome)
             VALUES ('dev-a', 1, 'ad-1', '18-29', 'female', 0.9, '2026-01-01', 'maybe')",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_newer_store_is_refused() {
        let conn = Connection::open_in_memory().unwrap();
        schema_version(&conn).unwrap();
        conn.execute("INSERT INTO schema_version (version) VALUES (42)", [])
            .unwrap();

        let err = run_migrations(&conn).unwrap_err();
        assert!(matches!(err, MigrationError::TooNew { found: 42, known: 1 }));
    }

    #[test]
    fn test_second_run_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiosk.db");
        let conn = Connection::open(&path).unwrap();
        assert_eq!(run_migrations(&conn).unwrap(), 1);
        assert_eq!(run_migrations(&conn).unwrap(), 0);
        // Nothing to snapshot when no upgrade ran.
        assert!(!dir.path().join("kiosk.db.pre-migration.bak").exists());
    }
}
