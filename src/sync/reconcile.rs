//! Applying pulled rows to the local store.
//!
//! Persons are mutable and versioned: a pulled version either descends from
//! the local one (fast-forward), is an ancestor of it (stale), or neither
//! (concurrent edit). Concurrent edits resolve last-writer-wins on
//! `updated_at`, then the lexicographically smallest writer device, then the
//! smallest content hash. Both sides of the fleet reach the same verdict and
//! derive the same conflict id, so each store ends up with one record per
//! conflict whichever device notices it first.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use super::checksum::content_hash;
use crate::db::sync::{decode_payload, display_sync_row, identification_sync_row, person_sync_row};
use crate::db::{
    ConflictRecord, ConflictResolution, ConflictSide, DbError, DisplayEvent, EntityType, IdentificationEvent,
    KioskDb, PersonPayload, SyncRow, VersionStamp,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionRelation {
    Identical,
    /// The incoming version has seen the local one.
    Descendant,
    /// The local version has seen the incoming one.
    Ancestor,
    Concurrent,
}

/// Whether `newer` has seen `older`.
fn has_seen(newer: &SyncRow, older: &VersionStamp) -> bool {
    if newer.origin_device == older.device_id && newer.seq > older.seq {
        return true;
    }
    match &newer.prev_version {
        Some(prev) => prev == older || (prev.device_id == older.device_id && prev.seq >= older.seq),
        None => false,
    }
}

pub fn relate(local: &SyncRow, remote: &SyncRow) -> VersionRelation {
    let local_version = local.version();
    let remote_version = remote.version();
    if local_version == remote_version {
        VersionRelation::Identical
    } else if has_seen(remote, &local_version) {
        VersionRelation::Descendant
    } else if has_seen(local, &remote_version) {
        VersionRelation::Ancestor
    } else {
        VersionRelation::Concurrent
    }
}

/// Last-writer-wins between two conflicting rows. Symmetric: swapping the
/// arguments flips the answer.
pub fn remote_wins(local: &SyncRow, remote: &SyncRow) -> Result<bool, serde_json::Error> {
    if remote.updated_at != local.updated_at {
        return Ok(remote.updated_at > local.updated_at);
    }
    if remote.origin_device != local.origin_device {
        return Ok(remote.origin_device < local.origin_device);
    }
    Ok(content_hash(remote)? < content_hash(local)?)
}

/// Deterministic id for the conflict between two versions of one key.
pub fn conflict_id(entity: EntityType, primary_key: &str, a: &VersionStamp, b: &VersionStamp) -> String {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = Sha256::new();
    hasher.update(entity.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(primary_key.as_bytes());
    hasher.update([0]);
    hasher.update(first.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(second.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub applied: usize,
    pub skipped: usize,
    pub conflicts: usize,
    /// Conflicts already on record (e.g. pulled from the device that saw them first).
    pub known_conflicts: usize,
}

impl ApplyStats {
    fn merge(&mut self, other: ApplyStats) {
        self.applied += other.applied;
        self.skipped += other.skipped;
        self.conflicts += other.conflicts;
        self.known_conflicts += other.known_conflicts;
    }
}

/// Apply pulled rows of one entity type in the given (remote-sequence)
/// order. Runs inside the caller's transaction.
pub fn apply_rows(db: &KioskDb, entity: EntityType, rows: &[SyncRow], now: DateTime<Utc>) -> Result<ApplyStats, DbError> {
    let mut stats = ApplyStats::default();
    for row in rows {
        if row.entity_type != entity {
            return Err(DbError::Corrupt(format!(
                "staged {} row under {}",
                row.entity_type, entity
            )));
        }
        let outcome = match entity {
            EntityType::Person => apply_person(db, row, now)?,
            EntityType::IdentificationEvent => apply_identification(db, row, now)?,
            EntityType::DisplayEvent => apply_display(db, row, now)?,
            EntityType::ConflictRecord => apply_conflict_record(db, row)?,
        };
        stats.merge(outcome);
    }
    Ok(stats)
}

fn apply_person(db: &KioskDb, remote: &SyncRow, now: DateTime<Utc>) -> Result<ApplyStats, DbError> {
    let payload: PersonPayload = decode_payload(remote)?;
    if payload.id != remote.primary_key {
        return Err(DbError::Corrupt(format!(
            "person row {} carries payload for {}",
            remote.primary_key, payload.id
        )));
    }
    let write_remote = |db: &KioskDb| {
        db.put_person_version(&payload, remote.updated_at, &remote.version(), remote.prev_version.as_ref())
    };

    let Some(local_person) = db.get_person(&remote.primary_key)? else {
        write_remote(db)?;
        return Ok(ApplyStats {
            applied: 1,
            ..ApplyStats::default()
        });
    };
    let local = person_sync_row(&local_person)?;

    match relate(&local, remote) {
        VersionRelation::Identical | VersionRelation::Ancestor => Ok(ApplyStats {
            skipped: 1,
            ..ApplyStats::default()
        }),
        VersionRelation::Descendant => {
            write_remote(db)?;
            Ok(ApplyStats {
                applied: 1,
                ..ApplyStats::default()
            })
        }
        VersionRelation::Concurrent => {
            let remote_won = resolve_conflict(db, &local, remote, now)?;
            if remote_won.won {
                write_remote(db)?;
            }
            Ok(remote_won.stats())
        }
    }
}

fn apply_identification(db: &KioskDb, remote: &SyncRow, now: DateTime<Utc>) -> Result<ApplyStats, DbError> {
    let event: IdentificationEvent = decode_payload(remote)?;
    check_event_key(remote, &event.origin_device, event.seq)?;
    let Some(existing) = db.get_identification_event(&event.origin_device, event.seq)? else {
        db.put_identification_event(&event)?;
        return Ok(ApplyStats {
            applied: 1,
            ..ApplyStats::default()
        });
    };
    let local = identification_sync_row(&existing)?;
    if local.payload == remote.payload && local.updated_at == remote.updated_at {
        return Ok(ApplyStats {
            skipped: 1,
            ..ApplyStats::default()
        });
    }
    let verdict = resolve_conflict(db, &local, remote, now)?;
    if verdict.won {
        db.conn_ref().execute(
            "DELETE FROM identification_events WHERE origin_device = ?1 AND seq = ?2",
            rusqlite::params![event.origin_device, event.seq],
        )?;
        db.put_identification_event(&event)?;
    }
    Ok(verdict.stats())
}

fn apply_display(db: &KioskDb, remote: &SyncRow, now: DateTime<Utc>) -> Result<ApplyStats, DbError> {
    let event: DisplayEvent = decode_payload(remote)?;
    check_event_key(remote, &event.origin_device, event.seq)?;
    let Some(existing) = db.get_display_event(&event.origin_device, event.seq)? else {
        db.put_display_event(&event)?;
        return Ok(ApplyStats {
            applied: 1,
            ..ApplyStats::default()
        });
    };
    let local = display_sync_row(&existing)?;
    if local.payload == remote.payload && local.updated_at == remote.updated_at {
        return Ok(ApplyStats {
            skipped: 1,
            ..ApplyStats::default()
        });
    }
    let verdict = resolve_conflict(db, &local, remote, now)?;
    if verdict.won {
        db.conn_ref().execute(
            "DELETE FROM display_events WHERE origin_device = ?1 AND seq = ?2",
            rusqlite::params![event.origin_device, event.seq],
        )?;
        db.put_display_event(&event)?;
    }
    Ok(verdict.stats())
}

fn apply_conflict_record(db: &KioskDb, remote: &SyncRow) -> Result<ApplyStats, DbError> {
    let record: ConflictRecord = decode_payload(remote)?;
    let written = db.put_conflict_record(&record)?;
    Ok(ApplyStats {
        applied: usize::from(written),
        skipped: usize::from(!written),
        ..ApplyStats::default()
    })
}

fn check_event_key(row: &SyncRow, origin: &str, seq: i64) -> Result<(), DbError> {
    if row.origin_device != origin || row.seq != seq {
        return Err(DbError::Corrupt(format!(
            "row {} carries payload for {}:{}",
            row.idempotency_key(),
            origin,
            seq
        )));
    }
    Ok(())
}

struct Verdict {
    won: bool,
    recorded: bool,
}

impl Verdict {
    fn stats(&self) -> ApplyStats {
        ApplyStats {
            applied: usize::from(self.won),
            skipped: usize::from(!self.won),
            conflicts: usize::from(self.recorded),
            known_conflicts: usize::from(!self.recorded),
        }
    }
}

/// Decide a conflict and write its audit record unless the same conflict is
/// already on record.
fn resolve_conflict(db: &KioskDb, local: &SyncRow, remote: &SyncRow, now: DateTime<Utc>) -> Result<Verdict, DbError> {
    let won = remote_wins(local, remote)?;
    let id = conflict_id(local.entity_type, &local.primary_key, &local.version(), &remote.version());
    if db.conflict_exists(&id)? {
        return Ok(Verdict { won, recorded: false });
    }

    let side = |row: &SyncRow| ConflictSide {
        version: row.version(),
        updated_at: row.updated_at,
        payload: row.payload.clone(),
    };
    let record = ConflictRecord {
        conflict_id: id,
        origin_device: db.device_id().to_string(),
        seq: db.next_seq()?,
        entity_type: local.entity_type,
        primary_key: local.primary_key.clone(),
        local_version: side(local),
        remote_version: side(remote),
        resolution: if won {
            ConflictResolution::RemoteWon
        } else {
            ConflictResolution::LocalWon
        },
        detected_at: now,
    };
    db.put_conflict_record(&record)?;
    log::warn!(
        "Conflict on {} {}: local {} vs remote {}, {}",
        record.entity_type,
        record.primary_key,
        record.local_version.version,
        record.remote_version.version,
        record.resolution.as_str()
    );
    Ok(Verdict { won, recorded: true })
}
