use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::*;
use crate::demographics::{AgeBucket, DemographicEstimate, Gender};
use crate::embeddings::{blob_to_f32_vec, f32_vec_to_blob};

pub(crate) const PERSON_COLUMNS: &str = "id, embedding, first_seen, last_seen, age_bucket, gender, confidence,
     retired, updated_at, updated_by, seq, prev_device, prev_seq, last_frame_at";

impl KioskDb {
    // =========================================================================
    // Persons
    // =========================================================================

    /// Create a person seen for the first time on this device.
    pub fn create_person(
        &self,
        id: &str,
        embedding: &[f32],
        demographics: Option<DemographicEstimate>,
        now: DateTime<Utc>,
    ) -> Result<DbPerson, DbError> {
        let payload = PersonPayload {
            id: id.to_string(),
            embedding: embedding.to_vec(),
            first_seen: now,
            last_seen: now,
            demographics,
            retired: false,
        };
        self.save_local_person(&payload, None, now)
    }

    /// Record a local edit of an existing person under a fresh version stamp
    /// that descends from the current one.
    pub fn update_person(&self, payload: &PersonPayload, now: DateTime<Utc>) -> Result<DbPerson, DbError> {
        let current = self
            .get_person(&payload.id)?
            .ok_or_else(|| DbError::NotFound(format!("person {}", payload.id)))?;
        self.save_local_person(payload, Some(current.version), now)
    }

    fn save_local_person(
        &self,
        payload: &PersonPayload,
        prev: Option<VersionStamp>,
        now: DateTime<Utc>,
    ) -> Result<DbPerson, DbError> {
        self.with_transaction(|db| {
            let seq = db.next_seq()?;
            let version = VersionStamp::new(db.device_id(), seq);
            db.put_person_version(payload, now, &version, prev.as_ref())?;
            db.get_person(&payload.id)?
                .ok_or_else(|| DbError::NotFound(format!("person {}", payload.id)))
        })
    }

    /// Write a person row with an explicit version. Used for local edits and
    /// for applying pulled versions; `last_frame_at` is device-local and kept.
    pub(crate) fn put_person_version(
        &self,
        payload: &PersonPayload,
        updated_at: DateTime<Utc>,
        version: &VersionStamp,
        prev: Option<&VersionStamp>,
    ) -> Result<(), DbError> {
        let (age_bucket, gender, confidence) = match &payload.demographics {
            Some(d) => (Some(d.age_bucket.as_str()), Some(d.gender.as_str()), Some(d.confidence)),
            None => (None, None, None),
        };
        self.conn.execute(
            "INSERT INTO persons (
                id, embedding, first_seen, last_seen, age_bucket, gender, confidence,
                retired, updated_at, updated_by, seq, prev_device, prev_seq
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(id) DO UPDATE SET
                embedding = excluded.embedding,
                first_seen = excluded.first_seen,
                last_seen = excluded.last_seen,
                age_bucket = excluded.age_bucket,
                gender = excluded.gender,
                confidence = excluded.confidence,
                retired = excluded.retired,
                updated_at = excluded.updated_at,
                updated_by = excluded.updated_by,
                seq = excluded.seq,
                prev_device = excluded.prev_device,
                prev_seq = excluded.prev_seq",
            params![
                payload.id,
                f32_vec_to_blob(&payload.embedding),
                payload.first_seen,
                payload.last_seen,
                age_bucket,
                gender,
                confidence,
                payload.retired as i32,
                updated_at,
                version.device_id,
                version.seq,
                prev.map(|p| p.device_id.as_str()),
                prev.map(|p| p.seq),
            ],
        )?;
        Ok(())
    }

    pub fn get_person(&self, id: &str) -> Result<Option<DbPerson>, DbError> {
        let sql = format!("SELECT {} FROM persons WHERE id = ?1", PERSON_COLUMNS);
        let person = self
            .conn
            .query_row(&sql, params![id], Self::map_person_row)
            .optional()?;
        Ok(person)
    }

    /// Embeddings of every non-retired person, for nearest-neighbour search.
    pub fn active_person_embeddings(&self) -> Result<Vec<(String, Vec<f32>)>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, embedding FROM persons WHERE retired = 0 ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            let embedding = blob_to_f32_vec(&blob).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Blob, Box::new(e))
            })?;
            Ok((id, embedding))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn count_persons(&self) -> Result<i64, DbError> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM persons WHERE retired = 0", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Persons whose last sighting precedes `cutoff` are soft-retired. Each
    /// retirement is a local edit and syncs like any other.
    pub fn retire_stale_persons(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<usize, DbError> {
        self.with_transaction(|db| {
            let stale: Vec<DbPerson> = {
                let sql = format!(
                    "SELECT {} FROM persons WHERE retired = 0 AND last_seen < ?1",
                    PERSON_COLUMNS
                );
                let mut stmt = db.conn.prepare(&sql)?;
                let rows = stmt.query_map(params![cutoff], Self::map_person_row)?;
                let mut items = Vec::new();
                for row in rows {
                    items.push(row?);
                }
                items
            };
            for person in &stale {
                let mut payload = person.payload();
                payload.retired = true;
                db.save_local_person(&payload, Some(person.version.clone()), now)?;
            }
            if !stale.is_empty() {
                log::info!("Retired {} persons not seen since {}", stale.len(), cutoff);
            }
            Ok(stale.len())
        })
    }

    /// Stamp the time a frame was last captured for this person. Device-local
    /// bookkeeping: does not bump the person's version.
    pub fn set_last_frame_at(&self, id: &str, at: DateTime<Utc>) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE persons SET last_frame_at = ?1 WHERE id = ?2",
            params![at, id],
        )?;
        Ok(())
    }

    pub(crate) fn map_person_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbPerson> {
        let blob: Vec<u8> = row.get(1)?;
        let embedding = blob_to_f32_vec(&blob).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Blob, Box::new(e))
        })?;
        let age_bucket: Option<String> = row.get(4)?;
        let demographics = match age_bucket {
            Some(_) => Some(DemographicEstimate {
                age_bucket: parse_column::<AgeBucket>(row, 4)?,
                gender: parse_column::<Gender>(row, 5)?,
                confidence: row.get(6)?,
            }),
            None => None,
        };
        let prev_device: Option<String> = row.get(11)?;
        let prev_seq: Option<i64> = row.get(12)?;
        Ok(DbPerson {
            id: row.get(0)?,
            embedding,
            first_seen: row.get(2)?,
            last_seen: row.get(3)?,
            demographics,
            retired: row.get::<_, i32>(7)? != 0,
            updated_at: row.get(8)?,
            version: VersionStamp::new(row.get::<_, String>(9)?, row.get(10)?),
            prev_version: match (prev_device, prev_seq) {
                (Some(device), Some(seq)) => Some(VersionStamp::new(device, seq)),
                _ => None,
            },
            last_frame_at: row.get(13)?,
        })
    }
}
