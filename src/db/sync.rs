//! Store-side sync bookkeeping: cursors, the outgoing change feed, the pull
//! staging area and the conflict audit trail.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::people::PERSON_COLUMNS;
use super::*;

const CONFLICT_COLUMNS: &str = "conflict_id, origin_device, seq, entity_type, primary_key,
     local_version, remote_version, resolution, detected_at";

impl KioskDb {
    // =========================================================================
    // Cursors
    // =========================================================================

    pub fn sync_cursor(&self, entity: EntityType) -> Result<SyncCursor, DbError> {
        let cursor = self
            .conn
            .query_row(
                "SELECT last_pushed_seq, last_pulled_remote_seq FROM sync_cursors
                 WHERE device_id = ?1 AND entity_type = ?2",
                params![self.device_id, entity.as_str()],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;
        let (last_pushed_seq, last_pulled_remote_seq) = cursor.unwrap_or((0, 0));
        Ok(SyncCursor {
            device_id: self.device_id.clone(),
            entity_type: entity,
            last_pushed_seq,
            last_pulled_remote_seq,
        })
    }

    /// Move the last-pushed mark forward. Never moves it backwards.
    pub fn advance_push_cursor(&self, entity: EntityType, seq: i64, now: DateTime<Utc>) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO sync_cursors (device_id, entity_type, last_pushed_seq, last_pulled_remote_seq, updated_at)
             VALUES (?1, ?2, ?3, 0, ?4)
             ON CONFLICT(device_id, entity_type) DO UPDATE SET
                last_pushed_seq = MAX(sync_cursors.last_pushed_seq, excluded.last_pushed_seq),
                updated_at = excluded.updated_at",
            params![self.device_id, entity.as_str(), seq, now],
        )?;
        Ok(())
    }

    /// Move the last-pulled remote mark forward. Never moves it backwards.
    pub fn advance_pull_cursor(
        &self,
        entity: EntityType,
        remote_seq: i64,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO sync_cursors (device_id, entity_type, last_pushed_seq, last_pulled_remote_seq, updated_at)
             VALUES (?1, ?2, 0, ?3, ?4)
             ON CONFLICT(device_id, entity_type) DO UPDATE SET
                last_pulled_remote_seq = MAX(sync_cursors.last_pulled_remote_seq, excluded.last_pulled_remote_seq),
                updated_at = excluded.updated_at",
            params![self.device_id, entity.as_str(), remote_seq, now],
        )?;
        Ok(())
    }

    // =========================================================================
    // Outgoing change feed
    // =========================================================================

    /// Locally originated rows of `entity` with `seq > after_seq`, ascending,
    /// at most `limit` of them.
    pub fn collect_outgoing(&self, entity: EntityType, after_seq: i64, limit: usize) -> Result<Vec<SyncRow>, DbError> {
        let limit = limit as i64;
        let device = self.device_id.as_str();
        match entity {
            EntityType::Person => {
                let sql = format!(
                    "SELECT {} FROM persons WHERE updated_by = ?1 AND seq > ?2 ORDER BY seq LIMIT ?3",
                    PERSON_COLUMNS
                );
                let mut stmt = self.conn.prepare(&sql)?;
                let rows = stmt.query_map(params![device, after_seq, limit], Self::map_person_row)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(person_sync_row(&row?)?);
                }
                Ok(out)
            }
            EntityType::IdentificationEvent => {
                let mut stmt = self.conn.prepare(
                    "SELECT origin_device, seq, person_id, observed_at, age_bucket, gender, confidence,
                            mood, frame_ref
                     FROM identification_events WHERE origin_device = ?1 AND seq > ?2
                     ORDER BY seq LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![device, after_seq, limit], Self::map_identification_row)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(identification_sync_row(&row?)?);
                }
                Ok(out)
            }
            EntityType::DisplayEvent => {
                let mut stmt = self.conn.prepare(
                    "SELECT origin_device, seq, ad_id, person_id, age_bucket, gender, confidence,
                            mood, shown_at, outcome, corrects_seq
                     FROM display_events WHERE origin_device = ?1 AND seq > ?2
                     ORDER BY seq LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![device, after_seq, limit], Self::map_display_row)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(display_sync_row(&row?)?);
                }
                Ok(out)
            }
            EntityType::ConflictRecord => {
                let sql = format!(
                    "SELECT {} FROM conflict_records WHERE origin_device = ?1 AND seq > ?2
                     ORDER BY seq LIMIT ?3",
                    CONFLICT_COLUMNS
                );
                let mut stmt = self.conn.prepare(&sql)?;
                let rows = stmt.query_map(params![device, after_seq, limit], Self::map_conflict_row)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(conflict_sync_row(&row?)?);
                }
                Ok(out)
            }
        }
    }

    /// Number of locally originated rows still waiting to be pushed.
    pub fn pending_outgoing(&self, entity: EntityType) -> Result<i64, DbError> {
        let after = self.sync_cursor(entity)?.last_pushed_seq;
        let sql = match entity {
            EntityType::Person => "SELECT COUNT(*) FROM persons WHERE updated_by = ?1 AND seq > ?2",
            EntityType::IdentificationEvent => {
                "SELECT COUNT(*) FROM identification_events WHERE origin_device = ?1 AND seq > ?2"
            }
            EntityType::DisplayEvent => {
                "SELECT COUNT(*) FROM display_events WHERE origin_device = ?1 AND seq > ?2"
            }
            EntityType::ConflictRecord => {
                "SELECT COUNT(*) FROM conflict_records WHERE origin_device = ?1 AND seq > ?2"
            }
        };
        let count = self
            .conn
            .query_row(sql, params![self.device_id, after], |row| row.get(0))?;
        Ok(count)
    }

    // =========================================================================
    // Pull staging
    // =========================================================================

    /// Stage pulled rows. Re-staging the same `(entity, origin, seq)` replaces
    /// the earlier copy.
    pub fn stage_rows(&self, rows: &[SyncRow]) -> Result<usize, DbError> {
        self.with_transaction(|db| {
            for row in rows {
                let remote_seq = row.remote_seq.ok_or_else(|| {
                    DbError::Corrupt(format!("pulled row {} has no remote sequence", row.idempotency_key()))
                })?;
                db.conn.execute(
                    "INSERT OR REPLACE INTO sync_staging (entity_type, origin_device, seq, remote_seq, row_json)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        row.entity_type.as_str(),
                        row.origin_device,
                        row.seq,
                        remote_seq,
                        serde_json::to_string(row)?,
                    ],
                )?;
            }
            Ok(rows.len())
        })
    }

    /// Staged rows of one entity type, in remote-sequence order.
    pub fn staged_rows(&self, entity: EntityType) -> Result<Vec<SyncRow>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT row_json FROM sync_staging WHERE entity_type = ?1 ORDER BY remote_seq",
        )?;
        let rows = stmt.query_map(params![entity.as_str()], |row| parse_json_column::<SyncRow>(row, 0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn clear_staging(&self, entity: EntityType) -> Result<usize, DbError> {
        let removed = self.conn.execute(
            "DELETE FROM sync_staging WHERE entity_type = ?1",
            params![entity.as_str()],
        )?;
        Ok(removed)
    }

    // =========================================================================
    // Conflict audit trail (append-only)
    // =========================================================================

    /// Insert a conflict record unless one with the same conflict id (or the
    /// same origin/seq) exists. Returns whether a row was written.
    pub fn put_conflict_record(&self, record: &ConflictRecord) -> Result<bool, DbError> {
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO conflict_records (
                conflict_id, origin_device, seq, entity_type, primary_key,
                local_version, remote_version, resolution, detected_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.conflict_id,
                record.origin_device,
                record.seq,
                record.entity_type.as_str(),
                record.primary_key,
                serde_json::to_string(&record.local_version)?,
                serde_json::to_string(&record.remote_version)?,
                record.resolution.as_str(),
                record.detected_at,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn conflict_exists(&self, conflict_id: &str) -> Result<bool, DbError> {
        let exists = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM conflict_records WHERE conflict_id = ?1)",
            params![conflict_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn conflicts_for_key(&self, entity: EntityType, primary_key: &str) -> Result<Vec<ConflictRecord>, DbError> {
        let sql = format!(
            "SELECT {} FROM conflict_records WHERE entity_type = ?1 AND primary_key = ?2
             ORDER BY detected_at, conflict_id",
            CONFLICT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![entity.as_str(), primary_key], Self::map_conflict_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn count_conflicts(&self) -> Result<i64, DbError> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM conflict_records", [], |row| row.get(0))?;
        Ok(count)
    }

    fn map_conflict_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConflictRecord> {
        Ok(ConflictRecord {
            conflict_id: row.get(0)?,
            origin_device: row.get(1)?,
            seq: row.get(2)?,
            entity_type: parse_column(row, 3)?,
            primary_key: row.get(4)?,
            local_version: parse_json_column(row, 5)?,
            remote_version: parse_json_column(row, 6)?,
            resolution: parse_column(row, 7)?,
            detected_at: row.get(8)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Row <-> transport form
// ---------------------------------------------------------------------------

pub fn person_sync_row(person: &DbPerson) -> Result<SyncRow, DbError> {
    Ok(SyncRow {
        entity_type: EntityType::Person,
        origin_device: person.version.device_id.clone(),
        seq: person.version.seq,
        primary_key: person.id.clone(),
        updated_at: person.updated_at,
        prev_version: person.prev_version.clone(),
        payload: serde_json::to_value(person.payload())?,
        remote_seq: None,
    })
}

pub fn identification_sync_row(event: &IdentificationEvent) -> Result<SyncRow, DbError> {
    Ok(SyncRow {
        entity_type: EntityType::IdentificationEvent,
        origin_device: event.origin_device.clone(),
        seq: event.seq,
        primary_key: format!("{}:{}", event.origin_device, event.seq),
        updated_at: event.observed_at,
        prev_version: None,
        payload: serde_json::to_value(event)?,
        remote_seq: None,
    })
}

pub fn display_sync_row(event: &DisplayEvent) -> Result<SyncRow, DbError> {
    Ok(SyncRow {
        entity_type: EntityType::DisplayEvent,
        origin_device: event.origin_device.clone(),
        seq: event.seq,
        primary_key: format!("{}:{}", event.origin_device, event.seq),
        updated_at: event.shown_at,
        prev_version: None,
        payload: serde_json::to_value(event)?,
        remote_seq: None,
    })
}

pub fn conflict_sync_row(record: &ConflictRecord) -> Result<SyncRow, DbError> {
    Ok(SyncRow {
        entity_type: EntityType::ConflictRecord,
        origin_device: record.origin_device.clone(),
        seq: record.seq,
        primary_key: record.conflict_id.clone(),
        updated_at: record.detected_at,
        prev_version: None,
        payload: serde_json::to_value(record)?,
        remote_seq: None,
    })
}

/// Decode a transport row's payload into its typed form.
pub fn decode_payload<T: serde::de::DeserializeOwned>(row: &SyncRow) -> Result<T, DbError> {
    serde_json::from_value(row.payload.clone()).map_err(|e| {
        DbError::Corrupt(format!("payload of {} does not decode: {}", row.idempotency_key(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;
    use crate::demographics::{AgeBucket, Gender, Observation};

    #[test]
    fn test_cursor_defaults_and_only_moves_forward() {
        let db = test_db("dev-a");
        let now = Utc::now();
        let cursor = db.sync_cursor(EntityType::Person).unwrap();
        assert_eq!((cursor.last_pushed_seq, cursor.last_pulled_remote_seq), (0, 0));

        db.advance_push_cursor(EntityType::Person, 7, now).unwrap();
        db.advance_push_cursor(EntityType::Person, 3, now).unwrap();
        db.advance_pull_cursor(EntityType::Person, 11, now).unwrap();
        let cursor = db.sync_cursor(EntityType::Person).unwrap();
        assert_eq!((cursor.last_pushed_seq, cursor.last_pulled_remote_seq), (7, 11));
        assert_eq!(db.sync_cursor(EntityType::DisplayEvent).unwrap().last_pushed_seq, 0);
    }

    #[test]
    fn test_collect_outgoing_only_local_rows_after_cursor() {
        let db = test_db("dev-a");
        let now = Utc::now();
        let obs = Observation::new(AgeBucket::Over60, Gender::Unknown, 0.4).unwrap();
        db.create_person("p1", &[1.0, 0.0], None, now).unwrap();
        db.record_identification_event("p1", &obs, None, now).unwrap();
        db.record_identification_event("p1", &obs, None, now).unwrap();

        let ids = db.collect_outgoing(EntityType::IdentificationEvent, 0, 10).unwrap();
        assert_eq!(ids.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![2, 3]);
        let after = db.collect_outgoing(EntityType::IdentificationEvent, 2, 10).unwrap();
        assert_eq!(after.len(), 1);
        let limited = db.collect_outgoing(EntityType::IdentificationEvent, 0, 1).unwrap();
        assert_eq!(limited.len(), 1);

        let persons = db.collect_outgoing(EntityType::Person, 0, 10).unwrap();
        assert_eq!(persons.len(), 1);
        assert_eq!(persons[0].primary_key, "p1");
        assert_eq!(db.pending_outgoing(EntityType::IdentificationEvent).unwrap(), 2);
    }

    #[test]
    fn test_staging_orders_by_remote_seq_and_clears() {
        let db = test_db("dev-a");
        let now = Utc::now();
        let person = db.create_person("p1", &[1.0, 0.0], None, now).unwrap();
        let mut first = person_sync_row(&person).unwrap();
        first.origin_device = "dev-b".into();
        first.remote_seq = Some(9);
        let mut second = first.clone();
        second.seq = 2;
        second.remote_seq = Some(4);

        db.stage_rows(&[first.clone(), second.clone()]).unwrap();
        let staged = db.staged_rows(EntityType::Person).unwrap();
        assert_eq!(staged, vec![second, first]);
        assert_eq!(db.clear_staging(EntityType::Person).unwrap(), 2);
        assert!(db.staged_rows(EntityType::Person).unwrap().is_empty());
    }

    #[test]
    fn test_staging_requires_remote_seq() {
        let db = test_db("dev-a");
        let person = db.create_person("p1", &[1.0, 0.0], None, Utc::now()).unwrap();
        let row = person_sync_row(&person).unwrap();
        assert!(matches!(db.stage_rows(&[row]), Err(DbError::Corrupt(_))));
    }
}
