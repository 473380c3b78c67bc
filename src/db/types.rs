//! Shared type definitions for the database layer.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::demographics::{AgeBucket, DemographicEstimate, Gender, Observation, TimeWindow};

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(#[from] crate::migrations::MigrationError),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Parse a text column through `FromStr`, surfacing failures as rusqlite
/// conversion errors so they can be raised from inside `query_map` closures.
pub(crate) fn parse_column<T>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn parse_json_column<T>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

// ---------------------------------------------------------------------------
// Sync bookkeeping
// ---------------------------------------------------------------------------

/// Tables that take part in fleet sync, in push priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Person,
    IdentificationEvent,
    DisplayEvent,
    ConflictRecord,
}

impl EntityType {
    /// Push order: persons before the events that reference them; the
    /// audit trail goes last.
    pub const PUSH_ORDER: [EntityType; 4] = [
        EntityType::Person,
        EntityType::IdentificationEvent,
        EntityType::DisplayEvent,
        EntityType::ConflictRecord,
    ];

    /// Apply order for pulled rows: conflict records first so a conflict the
    /// peer already recorded is known before persons are reconciled.
    pub const APPLY_ORDER: [EntityType; 4] = [
        EntityType::ConflictRecord,
        EntityType::Person,
        EntityType::IdentificationEvent,
        EntityType::DisplayEvent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Person => "person",
            EntityType::IdentificationEvent => "identification_event",
            EntityType::DisplayEvent => "display_event",
            EntityType::ConflictRecord => "conflict_record",
        }
    }

    /// Whether rows of this type are mutated in place (last-writer-wins) rather
    /// than append-only.
    pub fn is_mutable(&self) -> bool {
        matches!(self, EntityType::Person)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::PUSH_ORDER
            .iter()
            .copied()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| DbError::Corrupt(format!("unknown entity type: {}", s)))
    }
}

/// Identifies one write: the device that made it and its local sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionStamp {
    pub device_id: String,
    pub seq: i64,
}

impl VersionStamp {
    pub fn new(device_id: impl Into<String>, seq: i64) -> Self {
        Self {
            device_id: device_id.into(),
            seq,
        }
    }
}

impl fmt::Display for VersionStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device_id, self.seq)
    }
}

/// One row of a synced table in transport form.
///
/// `(origin_device, seq)` doubles as the idempotency key on the remote side.
/// `remote_seq` is assigned by the remote store and is absent on push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRow {
    pub entity_type: EntityType,
    pub origin_device: String,
    pub seq: i64,
    pub primary_key: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_version: Option<VersionStamp>,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_seq: Option<i64>,
}

impl SyncRow {
    pub fn version(&self) -> VersionStamp {
        VersionStamp::new(self.origin_device.clone(), self.seq)
    }

    pub fn idempotency_key(&self) -> String {
        format!("{}:{}:{}", self.origin_device, self.entity_type, self.seq)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCursor {
    pub device_id: String,
    pub entity_type: EntityType,
    pub last_pushed_seq: i64,
    pub last_pulled_remote_seq: i64,
}

// ---------------------------------------------------------------------------
// Persons
// ---------------------------------------------------------------------------

/// A row from the `persons` table.
#[derive(Debug, Clone, PartialEq)]
pub struct DbPerson {
    pub id: String,
    pub embedding: Vec<f32>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub demographics: Option<DemographicEstimate>,
    pub retired: bool,
    pub updated_at: DateTime<Utc>,
    pub version: VersionStamp,
    pub prev_version: Option<VersionStamp>,
    pub last_frame_at: Option<DateTime<Utc>>,
}

impl DbPerson {
    pub fn payload(&self) -> PersonPayload {
        PersonPayload {
            id: self.id.clone(),
            embedding: self.embedding.clone(),
            first_seen: self.first_seen,
            last_seen: self.last_seen,
            demographics: self.demographics,
            retired: self.retired,
        }
    }
}

/// Synced columns of a person. `last_frame_at` stays device-local.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonPayload {
    pub id: String,
    pub embedding: Vec<f32>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub demographics: Option<DemographicEstimate>,
    #[serde(default)]
    pub retired: bool,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A row from the `identification_events` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentificationEvent {
    pub origin_device: String,
    pub seq: i64,
    pub person_id: String,
    pub observed_at: DateTime<Utc>,
    pub observation: Observation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_ref: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayOutcome {
    Shown,
    Skipped,
    Error,
}

impl DisplayOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisplayOutcome::Shown => "shown",
            DisplayOutcome::Skipped => "skipped",
            DisplayOutcome::Error => "error",
        }
    }
}

impl FromStr for DisplayOutcome {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shown" => Ok(DisplayOutcome::Shown),
            "skipped" => Ok(DisplayOutcome::Skipped),
            "error" => Ok(DisplayOutcome::Error),
            other => Err(DbError::Corrupt(format!("unknown display outcome: {}", other))),
        }
    }
}

/// A row from the `display_events` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayEvent {
    pub origin_device: String,
    pub seq: i64,
    pub ad_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub person_id: Option<String>,
    pub observation: Observation,
    pub shown_at: DateTime<Utc>,
    pub outcome: DisplayOutcome,
    /// Set on correction rows: the display event whose outcome this replaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrects_seq: Option<i64>,
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// A row from the `advertisements` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Advertisement {
    pub id: String,
    pub customer_id: String,
    pub media_ref: String,
    pub media_type: String,
    /// Empty means "any age".
    #[serde(default)]
    pub age_buckets: Vec<AgeBucket>,
    /// Empty means "any gender".
    #[serde(default)]
    pub genders: Vec<Gender>,
    #[serde(default)]
    pub time_window: Option<TimeWindow>,
    #[serde(default)]
    pub mood_target: Option<String>,
    pub base_weight: f64,
    pub active: bool,
}

impl Advertisement {
    /// Demographic part of the filter; the time window is checked separately
    /// because it needs the kiosk timezone.
    pub fn matches_observation(&self, observation: &Observation) -> bool {
        let age_ok = self.age_buckets.is_empty() || self.age_buckets.contains(&observation.age_bucket);
        let gender_ok = self.genders.is_empty() || self.genders.contains(&observation.gender);
        age_ok && gender_ok
    }
}

// ---------------------------------------------------------------------------
// Conflicts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    LocalWon,
    RemoteWon,
}

impl ConflictResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictResolution::LocalWon => "local_won",
            ConflictResolution::RemoteWon => "remote_won",
        }
    }
}

impl FromStr for ConflictResolution {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local_won" => Ok(ConflictResolution::LocalWon),
            "remote_won" => Ok(ConflictResolution::RemoteWon),
            other => Err(DbError::Corrupt(format!("unknown conflict resolution: {}", other))),
        }
    }
}

/// One side of a conflict as captured in the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictSide {
    pub version: VersionStamp,
    pub updated_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// A row from the `conflict_records` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub conflict_id: String,
    pub origin_device: String,
    pub seq: i64,
    pub entity_type: EntityType,
    pub primary_key: String,
    pub local_version: ConflictSide,
    pub remote_version: ConflictSide,
    pub resolution: ConflictResolution,
    pub detected_at: DateTime<Utc>,
}
