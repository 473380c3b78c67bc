use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::*;
use crate::demographics::{AgeBucket, Gender, Observation};

const IDENTIFICATION_COLUMNS: &str =
    "origin_device, seq, person_id, observed_at, age_bucket, gender, confidence, mood, frame_ref";

const DISPLAY_COLUMNS: &str = "origin_device, seq, ad_id, person_id, age_bucket, gender, confidence,
     mood, shown_at, outcome, corrects_seq";

/// Display rows that count as a real showing: outcome `shown` and not
/// superseded by a later correction row from the same device.
const SHOWN_FILTER: &str = "d.outcome = 'shown' AND NOT EXISTS (
        SELECT 1 FROM display_events c
        WHERE c.origin_device = d.origin_device AND c.corrects_seq = d.seq
    )";

impl KioskDb {
    // =========================================================================
    // Identification events (append-only)
    // =========================================================================

    pub fn record_identification_event(
        &self,
        person_id: &str,
        observation: &Observation,
        frame_ref: Option<&str>,
        observed_at: DateTime<Utc>,
    ) -> Result<IdentificationEvent, DbError> {
        self.with_transaction(|db| {
            let event = IdentificationEvent {
                origin_device: db.device_id().to_string(),
                seq: db.next_seq()?,
                person_id: person_id.to_string(),
                observed_at,
                observation: observation.clone(),
                frame_ref: frame_ref.map(str::to_string),
            };
            db.put_identification_event(&event)?;
            Ok(event)
        })
    }

    /// Insert an identification event unless `(origin_device, seq)` already
    /// exists. Returns whether a row was written.
    pub(crate) fn put_identification_event(&self, event: &IdentificationEvent) -> Result<bool, DbError> {
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO identification_events (
                origin_device, seq, person_id, observed_at, age_bucket, gender, confidence,
                mood, frame_ref
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                event.origin_device,
                event.seq,
                event.person_id,
                event.observed_at,
                event.observation.age_bucket.as_str(),
                event.observation.gender.as_str(),
                event.observation.confidence,
                event.observation.mood,
                event.frame_ref,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get_identification_event(
        &self,
        origin_device: &str,
        seq: i64,
    ) -> Result<Option<IdentificationEvent>, DbError> {
        let sql = format!(
            "SELECT {} FROM identification_events WHERE origin_device = ?1 AND seq = ?2",
            IDENTIFICATION_COLUMNS
        );
        let event = self
            .conn
            .query_row(&sql, params![origin_device, seq], Self::map_identification_row)
            .optional()?;
        Ok(event)
    }

    pub fn identifications_for_person(&self, person_id: &str) -> Result<Vec<IdentificationEvent>, DbError> {
        let sql = format!(
            "SELECT {} FROM identification_events WHERE person_id = ?1
             ORDER BY observed_at, origin_device, seq",
            IDENTIFICATION_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![person_id], Self::map_identification_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub(crate) fn map_identification_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IdentificationEvent> {
        Ok(IdentificationEvent {
            origin_device: row.get(0)?,
            seq: row.get(1)?,
            person_id: row.get(2)?,
            observed_at: row.get(3)?,
            observation: Observation {
                age_bucket: parse_column::<AgeBucket>(row, 4)?,
                gender: parse_column::<Gender>(row, 5)?,
                confidence: row.get(6)?,
                mood: row.get(7)?,
            },
            frame_ref: row.get(8)?,
        })
    }

    // =========================================================================
    // Display events (append-only)
    // =========================================================================

    pub fn record_display_event(
        &self,
        ad_id: &str,
        person_id: Option<&str>,
        observation: &Observation,
        shown_at: DateTime<Utc>,
        outcome: DisplayOutcome,
        corrects_seq: Option<i64>,
    ) -> Result<DisplayEvent, DbError> {
        self.with_transaction(|db| {
            let event = DisplayEvent {
                origin_device: db.device_id().to_string(),
                seq: db.next_seq()?,
                ad_id: ad_id.to_string(),
                person_id: person_id.map(str::to_string),
                observation: observation.clone(),
                shown_at,
                outcome,
                corrects_seq,
            };
            db.put_display_event(&event)?;
            Ok(event)
        })
    }

    pub(crate) fn put_display_event(&self, event: &DisplayEvent) -> Result<bool, DbError> {
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO display_events (
                origin_device, seq, ad_id, person_id, age_bucket, gender, confidence,
                mood, shown_at, outcome, corrects_seq
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                event.origin_device,
                event.seq,
                event.ad_id,
                event.person_id,
                event.observation.age_bucket.as_str(),
                event.observation.gender.as_str(),
                event.observation.confidence,
                event.observation.mood,
                event.shown_at,
                event.outcome.as_str(),
                event.corrects_seq,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get_display_event(&self, origin_device: &str, seq: i64) -> Result<Option<DisplayEvent>, DbError> {
        let sql = format!(
            "SELECT {} FROM display_events WHERE origin_device = ?1 AND seq = ?2",
            DISPLAY_COLUMNS
        );
        let event = self
            .conn
            .query_row(&sql, params![origin_device, seq], Self::map_display_row)
            .optional()?;
        Ok(event)
    }

    /// Effective showings on `device_id` since `since`, oldest first by local
    /// sequence. Corrected and non-`shown` rows are excluded.
    pub fn shown_history(
        &self,
        device_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<(String, DateTime<Utc>)>, DbError> {
        let sql = format!(
            "SELECT d.ad_id, d.shown_at FROM display_events d
             WHERE d.origin_device = ?1 AND d.shown_at >= ?2 AND {}
             ORDER BY d.seq",
            SHOWN_FILTER
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![device_id, since], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub(crate) fn map_display_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DisplayEvent> {
        Ok(DisplayEvent {
            origin_device: row.get(0)?,
            seq: row.get(1)?,
            ad_id: row.get(2)?,
            person_id: row.get(3)?,
            observation: Observation {
                age_bucket: parse_column::<AgeBucket>(row, 4)?,
                gender: parse_column::<Gender>(row, 5)?,
                confidence: row.get(6)?,
                mood: row.get(7)?,
            },
            shown_at: row.get(8)?,
            outcome: parse_column::<DisplayOutcome>(row, 9)?,
            corrects_seq: row.get(10)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;
    use chrono::Duration;

    fn obs() -> Observation {
        Observation::new(AgeBucket::From18To29, Gender::Male, 0.9).unwrap()
    }

    #[test]
    fn test_identification_event_roundtrip() {
        let db = test_db("dev-a");
        let now = Utc::now();
        let written = db
            .record_identification_event("p1", &obs().with_mood("happy"), Some("frames/p1.jpg"), now)
            .unwrap();
        assert_eq!(written.seq, 1);
        let read = db.get_identification_event("dev-a", 1).unwrap().unwrap();
        assert_eq!(read.person_id, "p1");
        assert_eq!(read.observation.mood.as_deref(), Some("happy"));
        assert_eq!(read.frame_ref.as_deref(), Some("frames/p1.jpg"));
        assert_eq!(db.identifications_for_person("p1").unwrap().len(), 1);
    }

    #[test]
    fn test_put_is_idempotent_on_origin_and_seq() {
        let db = test_db("dev-a");
        let event = db
            .record_display_event("ad-1", None, &obs(), Utc::now(), DisplayOutcome::Shown, None)
            .unwrap();
        assert!(!db.put_display_event(&event).unwrap());
    }

    #[test]
    fn test_shown_history_skips_corrected_rows() {
        let db = test_db("dev-a");
        let now = Utc::now();
        let first = db
            .record_display_event("ad-1", None, &obs(), now - Duration::seconds(30), DisplayOutcome::Shown, None)
            .unwrap();
        db.record_display_event("ad-2", None, &obs(), now - Duration::seconds(20), DisplayOutcome::Shown, None)
            .unwrap();
        db.record_display_event("ad-1", None, &obs(), now, DisplayOutcome::Skipped, Some(first.seq))
            .unwrap();

        let history = db.shown_history("dev-a", now - Duration::hours(1)).unwrap();
        let ads: Vec<&str> = history.iter().map(|(ad, _)| ad.as_str()).collect();
        assert_eq!(ads, vec!["ad-2"]);
        assert!(db.shown_history("dev-b", now - Duration::hours(1)).unwrap().is_empty());
    }
}
