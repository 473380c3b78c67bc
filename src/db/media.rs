use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::*;
use crate::demographics::TimeWindow;

const AD_COLUMNS: &str = "id, customer_id, media_ref, media_type, age_buckets, genders,
     window_start, window_end, mood_target, base_weight, active";

impl KioskDb {
    // =========================================================================
    // Media catalog
    // =========================================================================

    /// Insert or replace a catalog entry. Catalog administration is the only
    /// writer; selection treats the table as read-only.
    pub fn upsert_advertisement(&self, ad: &Advertisement, now: DateTime<Utc>) -> Result<(), DbError> {
        if !ad.base_weight.is_finite() || ad.base_weight < 0.0 {
            return Err(DbError::Corrupt(format!(
                "advertisement {} has invalid base weight {}",
                ad.id, ad.base_weight
            )));
        }
        self.conn.execute(
            "INSERT INTO advertisements (
                id, customer_id, media_ref, media_type, age_buckets, genders,
                window_start, window_end, mood_target, base_weight, active, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO UPDATE SET
                customer_id = excluded.customer_id,
                media_ref = excluded.media_ref,
                media_type = excluded.media_type,
                age_buckets = excluded.age_buckets,
                genders = excluded.genders,
                window_start = excluded.window_start,
                window_end = excluded.window_end,
                mood_target = excluded.mood_target,
                base_weight = excluded.base_weight,
                active = excluded.active,
                updated_at = excluded.updated_at",
            params![
                ad.id,
                ad.customer_id,
                ad.media_ref,
                ad.media_type,
                serde_json::to_string(&ad.age_buckets)?,
                serde_json::to_string(&ad.genders)?,
                ad.time_window.map(|w| w.start_minute),
                ad.time_window.map(|w| w.end_minute),
                ad.mood_target,
                ad.base_weight,
                ad.active as i32,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn get_advertisement(&self, id: &str) -> Result<Option<Advertisement>, DbError> {
        let sql = format!("SELECT {} FROM advertisements WHERE id = ?1", AD_COLUMNS);
        let ad = self
            .conn
            .query_row(&sql, params![id], Self::map_ad_row)
            .optional()?;
        Ok(ad)
    }

    /// Active catalog, ordered by id so weight vectors line up across calls.
    pub fn active_advertisements(&self) -> Result<Vec<Advertisement>, DbError> {
        self.query_ads("WHERE active = 1")
    }

    pub fn list_advertisements(&self) -> Result<Vec<Advertisement>, DbError> {
        self.query_ads("")
    }

    fn query_ads(&self, filter: &str) -> Result<Vec<Advertisement>, DbError> {
        let sql = format!("SELECT {} FROM advertisements {} ORDER BY id", AD_COLUMNS, filter);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::map_ad_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Deactivate every active advertisement whose id is not in `keep`.
    /// Rows are kept so display history keeps resolving.
    pub fn deactivate_missing(&self, keep: &HashSet<String>, now: DateTime<Utc>) -> Result<usize, DbError> {
        self.with_transaction(|db| {
            let mut deactivated = 0;
            for ad in db.active_advertisements()? {
                if keep.contains(&ad.id) {
                    continue;
                }
                db.conn.execute(
                    "UPDATE advertisements SET active = 0, updated_at = ?1 WHERE id = ?2",
                    params![now, ad.id],
                )?;
                deactivated += 1;
            }
            Ok(deactivated)
        })
    }

    fn map_ad_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Advertisement> {
        let window_start: Option<u16> = row.get(6)?;
        let window_end: Option<u16> = row.get(7)?;
        Ok(Advertisement {
            id: row.get(0)?,
            customer_id: row.get(1)?,
            media_ref: row.get(2)?,
            media_type: row.get(3)?,
            age_buckets: parse_json_column(row, 4)?,
            genders: parse_json_column(row, 5)?,
            time_window: match (window_start, window_end) {
                (Some(start_minute), Some(end_minute)) => Some(TimeWindow {
                    start_minute,
                    end_minute,
                }),
                _ => None,
            },
            mood_target: row.get(8)?,
            base_weight: row.get(9)?,
            active: row.get::<_, i32>(10)? != 0,
        })
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn ad(id: &str, base_weight: f64) -> Advertisement {
        Advertisement {
            id: id.to_string(),
            customer_id: "cust-1".to_string(),
            media_ref: format!("media/{}.mp4", id),
            media_type: "video".to_string(),
            age_buckets: Vec::new(),
            genders: Vec::new(),
            time_window: None,
            mood_target: None,
            base_weight,
            active: true,
        }
    }
}
