//! Read-only audience and display reporting over the local store.
//!
//! Reports cover everything the store holds, so once sync has caught up a
//! kiosk can report on the whole fleet. Windows are half-open: `[since, until)`.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;

use crate::db::{parse_column, DbError, DisplayOutcome, KioskDb};
use crate::demographics::{AgeBucket, Gender, Observation};

const GENDERS: [Gender; 3] = [Gender::Male, Gender::Female, Gender::Unknown];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudienceSlice {
    pub age_bucket: AgeBucket,
    pub gender: Gender,
    pub identifications: i64,
    pub unique_persons: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdDisplayCount {
    pub ad_id: String,
    pub shown: i64,
    pub skipped: i64,
    pub errors: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DemographicProfit {
    pub age_bucket: AgeBucket,
    pub gender: Gender,
    pub matching_ads: usize,
    /// Mean base weight of the active ads this demographic is eligible for.
    pub expected_profit: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KioskReport {
    pub device_id: String,
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub unique_visitors: i64,
    pub audience: Vec<AudienceSlice>,
    pub displays: Vec<AdDisplayCount>,
    pub expected_profit: Vec<DemographicProfit>,
}

/// Identifications per demographic in the window, most common first.
pub fn audience_breakdown(
    db: &KioskDb,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<Vec<AudienceSlice>, DbError> {
    let mut stmt = db.conn_ref().prepare(
        "SELECT age_bucket, gender, COUNT(*), COUNT(DISTINCT person_id)
         FROM identification_events
         WHERE observed_at >= ?1 AND observed_at < ?2
         GROUP BY age_bucket, gender",
    )?;
    let rows = stmt.query_map(params![since, until], |row| {
        Ok(AudienceSlice {
            age_bucket: parse_column::<AgeBucket>(row, 0)?,
            gender: parse_column::<Gender>(row, 1)?,
            identifications: row.get(2)?,
            unique_persons: row.get(3)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    out.sort_by(|a, b| {
        b.identifications
            .cmp(&a.identifications)
            .then_with(|| a.age_bucket.cmp(&b.age_bucket))
            .then_with(|| a.gender.cmp(&b.gender))
    });
    Ok(out)
}

/// Distinct persons identified in the window.
pub fn unique_visitors(db: &KioskDb, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<i64, DbError> {
    let count = db.conn_ref().query_row(
        "SELECT COUNT(DISTINCT person_id) FROM identification_events
         WHERE observed_at >= ?1 AND observed_at < ?2",
        params![since, until],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Display outcomes per ad in the window, ordered by ad id.
///
/// Each original display row counts once, under the outcome of its latest
/// correction when one exists.
pub fn display_counts(
    db: &KioskDb,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<Vec<AdDisplayCount>, DbError> {
    let mut stmt = db.conn_ref().prepare(
        "SELECT d.ad_id, COALESCE(
                (SELECT c.outcome FROM display_events c
                 WHERE c.origin_device = d.origin_device AND c.corrects_seq = d.seq
                 ORDER BY c.seq DESC LIMIT 1),
                d.outcome)
         FROM display_events d
         WHERE d.corrects_seq IS NULL AND d.shown_at >= ?1 AND d.shown_at < ?2",
    )?;
    let rows = stmt.query_map(params![since, until], |row| {
        Ok((row.get::<_, String>(0)?, parse_column::<DisplayOutcome>(row, 1)?))
    })?;

    let mut counts: BTreeMap<String, AdDisplayCount> = BTreeMap::new();
    for row in rows {
        let (ad_id, outcome) = row?;
        let entry = counts.entry(ad_id.clone()).or_insert_with(|| AdDisplayCount {
            ad_id,
            ..AdDisplayCount::default()
        });
        match outcome {
            DisplayOutcome::Shown => entry.shown += 1,
            DisplayOutcome::Skipped => entry.skipped += 1,
            DisplayOutcome::Error => entry.errors += 1,
        }
    }
    Ok(counts.into_values().collect())
}

/// Expected profit for every demographic: the mean base weight of the active
/// ads whose audience filter admits it. Time windows are ignored.
pub fn expected_profit_by_demographic(db: &KioskDb) -> Result<Vec<DemographicProfit>, DbError> {
    let ads = db.active_advertisements()?;
    let mut out = Vec::with_capacity(AgeBucket::ALL.len() * GENDERS.len());
    for age_bucket in AgeBucket::ALL {
        for gender in GENDERS {
            let observation = Observation {
                age_bucket,
                gender,
                confidence: 1.0,
                mood: None,
            };
            let weights: Vec<f64> = ads
                .iter()
                .filter(|ad| ad.matches_observation(&observation))
                .map(|ad| ad.base_weight)
                .collect();
            let expected_profit = if weights.is_empty() {
                None
            } else {
                Some(weights.iter().sum::<f64>() / weights.len() as f64)
            };
            out.push(DemographicProfit {
                age_bucket,
                gender,
                matching_ads: weights.len(),
                expected_profit,
            });
        }
    }
    Ok(out)
}

pub fn generate_report(db: &KioskDb, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<KioskReport, DbError> {
    let report = KioskReport {
        device_id: db.device_id().to_string(),
        since,
        until,
        unique_visitors: unique_visitors(db, since, until)?,
        audience: audience_breakdown(db, since, until)?,
        displays: display_counts(db, since, until)?,
        expected_profit: expected_profit_by_demographic(db)?,
    };
    log::debug!(
        "Report for {}: {} visitors, {} ads displayed",
        report.device_id,
        report.unique_visitors,
        report.displays.len()
    );
    Ok(report)
}

/// Shown counts keyed by ad id, for callers that only need the totals.
pub fn shown_totals(displays: &[AdDisplayCount]) -> HashMap<&str, i64> {
    displays.iter().map(|d| (d.ad_id.as_str(), d.shown)).collect()
}
