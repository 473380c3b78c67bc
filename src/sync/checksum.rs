//! Batch integrity checksum: row count plus SHA-256 over canonical row bytes.
//!
//! Rows are hashed in `(entity, origin_device, seq)` order, so the checksum
//! does not depend on transmission order. `remote_seq` is excluded; it is
//! assigned by the remote store after the fact.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::db::{EntityType, SyncRow, VersionStamp};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchChecksum {
    pub row_count: usize,
    pub digest: String,
}

impl fmt::Display for BatchChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.digest.get(..12).unwrap_or(&self.digest);
        write!(f, "{} rows/{}", self.row_count, short)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CanonicalRow<'a> {
    entity_type: EntityType,
    origin_device: &'a str,
    seq: i64,
    primary_key: &'a str,
    updated_at: String,
    prev_version: Option<&'a VersionStamp>,
    payload: &'a serde_json::Value,
}

/// Canonical byte form of one row. Object keys serialize sorted.
pub fn canonical_bytes(row: &SyncRow) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&CanonicalRow {
        entity_type: row.entity_type,
        origin_device: &row.origin_device,
        seq: row.seq,
        primary_key: &row.primary_key,
        updated_at: row.updated_at.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
        prev_version: row.prev_version.as_ref(),
        payload: &row.payload,
    })
}

pub fn checksum(rows: &[SyncRow]) -> Result<BatchChecksum, serde_json::Error> {
    let mut ordered: Vec<&SyncRow> = rows.iter().collect();
    ordered.sort_by(|a, b| {
        (a.entity_type, a.origin_device.as_str(), a.seq).cmp(&(b.entity_type, b.origin_device.as_str(), b.seq))
    });

    let mut hasher = Sha256::new();
    for row in ordered {
        let bytes = canonical_bytes(row)?;
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(&bytes);
    }
    Ok(BatchChecksum {
        row_count: rows.len(),
        digest: hex::encode(hasher.finalize()),
    })
}

/// Content hash of a single row's payload, used as the last LWW tie-break.
pub fn content_hash(row: &SyncRow) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(&row.payload)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn row(origin: &str, seq: i64, value: i64) -> SyncRow {
        SyncRow {
            entity_type: EntityType::DisplayEvent,
            origin_device: origin.to_string(),
            seq,
            primary_key: format!("{}:{}", origin, seq),
            updated_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            prev_version: None,
            payload: serde_json::json!({ "value": value, "adId": "ad-1" }),
            remote_seq: None,
        }
    }

    #[test]
    fn test_order_and_remote_seq_do_not_matter() {
        let a = vec![row("dev-a", 1, 10), row("dev-a", 2, 20)];
        let mut b = vec![row("dev-a", 2, 20), row("dev-a", 1, 10)];
        b[0].remote_seq = Some(77);
        assert_eq!(checksum(&a).unwrap(), checksum(&b).unwrap());
    }

    #[test]
    fn test_content_and_count_changes_are_detected() {
        let base = vec![row("dev-a", 1, 10), row("dev-a", 2, 20)];
        let tampered = vec![row("dev-a", 1, 10), row("dev-a", 2, 21)];
        let short = vec![row("dev-a", 1, 10)];
        let sum = checksum(&base).unwrap();
        assert_ne!(sum, checksum(&tampered).unwrap());
        assert_eq!(checksum(&short).unwrap().row_count, 1);
        assert_eq!(sum.row_count, 2);
        assert_eq!(sum.digest.len(), 64);
    }

    #[test]
    fn test_survives_json_transport() {
        let rows = vec![row("dev-b", 4, 1)];
        let wire = serde_json::to_string(&rows).unwrap();
        let back: Vec<SyncRow> = serde_json::from_str(&wire).unwrap();
        assert_eq!(checksum(&rows).unwrap(), checksum(&back).unwrap());
    }
}
