//! Media catalog ingest from object storage.
//!
//! Catalog objects are laid out as
//! `<prefix>/<device>/<customer>/<gender>/<age>/<profit>[/<mood>[/<time_of_day>]]/<file>`.
//! Older uploads without the profit folder are still accepted at profit 0.
//! Each object becomes one advertisement; its media is downloaded into the
//! media directory. Ads whose objects disappeared are deactivated, never
//! deleted, so display history keeps resolving.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::watch;

use crate::db::{Advertisement, DbError, SharedDb};
use crate::demographics::{AgeBucket, DemographicError, Gender, TimeWindow};
use crate::object_store::{ObjectMeta, ObjectStore, ObjectStoreError};
use crate::types::CatalogConfig;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Malformed catalog key {key}: {reason}")]
    MalformedKey { key: String, reason: String },

    #[error("Object store error: {0}")]
    Store(#[from] ObjectStoreError),

    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("Media file error: {0}")]
    Io(#[from] std::io::Error),
}

/// Labels meaning "no restriction" in a targeting folder.
const ANY_LABELS: [&str; 4] = ["all", "any", "unknown", ""];
/// Mood folder labels meaning "no mood target".
const NO_MOOD_LABELS: [&str; 3] = ["neutral", "none", ""];

/// One parsed catalog object.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub key: String,
    pub customer_id: String,
    pub genders: Vec<Gender>,
    pub age_buckets: Vec<AgeBucket>,
    pub profit: f64,
    pub mood: Option<String>,
    pub time_window: Option<TimeWindow>,
    pub filename: String,
}

impl CatalogEntry {
    /// Stable advertisement id derived from the object key.
    pub fn ad_id(&self) -> String {
        let digest = hex::encode(Sha256::digest(self.key.as_bytes()));
        format!("ad-{}", &digest[..16])
    }

    pub fn local_filename(&self) -> String {
        format!("{}-{}", self.ad_id(), self.filename)
    }

    pub fn to_advertisement(&self, media_dir: &Path) -> Option<Advertisement> {
        let media_type = media_type_for(&self.filename)?;
        Some(Advertisement {
            id: self.ad_id(),
            customer_id: self.customer_id.clone(),
            media_ref: media_dir.join(self.local_filename()).to_string_lossy().into_owned(),
            media_type: media_type.to_string(),
            age_buckets: self.age_buckets.clone(),
            genders: self.genders.clone(),
            time_window: self.time_window,
            mood_target: self.mood.clone(),
            base_weight: self.profit,
            active: true,
        })
    }
}

/// Parse a catalog key belonging to `device_id`.
pub fn parse_key(prefix: &str, device_id: &str, key: &str) -> Result<CatalogEntry, CatalogError> {
    let malformed = |reason: &str| CatalogError::MalformedKey {
        key: key.to_string(),
        reason: reason.to_string(),
    };
    let device_prefix = format!("{}/{}/", prefix.trim_end_matches('/'), device_id);
    let rest = key
        .strip_prefix(&device_prefix)
        .ok_or_else(|| malformed("not under this device's prefix"))?;
    let parts: Vec<&str> = rest.split('/').collect();
    if !(4..=7).contains(&parts.len()) {
        return Err(malformed("expected customer/gender/age[/profit[/mood[/time_of_day]]]/file"));
    }

    let demographic = |e: DemographicError| malformed(&e.to_string());
    let customer_id = parts[0].trim();
    if customer_id.is_empty() {
        return Err(malformed("empty customer id"));
    }
    let genders = if is_any(parts[1]) {
        Vec::new()
    } else {
        vec![parts[1].parse::<Gender>().map_err(demographic)?]
    };
    let age_buckets = if is_any(parts[2]) {
        Vec::new()
    } else {
        vec![parts[2].parse::<AgeBucket>().map_err(demographic)?]
    };
    // A missing or non-numeric profit counts as zero; selection floors the weight.
    let profit = if parts.len() == 4 {
        0.0
    } else {
        parts[3]
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|p| p.is_finite() && *p >= 0.0)
            .unwrap_or(0.0)
    };

    let (mood, time_window) = match parts.len() {
        4 | 5 => (None, None),
        6 => (mood_label(parts[4]), None),
        _ => (
            mood_label(parts[4]),
            TimeWindow::parse_label(parts[5]).map_err(demographic)?,
        ),
    };

    let filename = parts.last().map(|f| sanitize_filename(f)).unwrap_or_default();
    if filename.is_empty() {
        return Err(malformed("empty file name"));
    }

    Ok(CatalogEntry {
        key: key.to_string(),
        customer_id: customer_id.to_string(),
        genders,
        age_buckets,
        profit,
        mood,
        time_window,
        filename,
    })
}

fn is_any(label: &str) -> bool {
    ANY_LABELS.contains(&label.trim().to_lowercase().as_str())
}

fn mood_label(label: &str) -> Option<String> {
    let normalized = label.trim().to_lowercase();
    if NO_MOOD_LABELS.contains(&normalized.as_str()) {
        None
    } else {
        Some(normalized)
    }
}

/// Strip an artifact suffix some uploaders append after the extension,
/// e.g. `spot.jpg.2e6d3AD3` becomes `spot.jpg`.
pub fn sanitize_filename(filename: &str) -> String {
    if let Some((stem, suffix)) = filename.rsplit_once('.') {
        if suffix.len() > 3 && media_type_for(filename).is_none() && media_type_for(stem).is_some() {
            return stem.to_string();
        }
    }
    filename.to_string()
}

/// MIME-style media type from the file extension. `None` for anything the
/// display cannot play.
pub fn media_type_for(filename: &str) -> Option<&'static str> {
    let ext = Path::new(filename).extension()?.to_str()?.to_lowercase();
    Some(match ext.as_str() {
        "mp4" => "video/mp4",
        "avi" => "video/avi",
        "mov" => "video/mov",
        "jpg" => "image/jpg",
        "jpeg" => "image/jpeg",
        "png" => "image/png",
        _ => return None,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub listed: usize,
    pub downloaded: usize,
    pub upserted: usize,
    pub rejected: usize,
    pub deactivated: usize,
}

/// Mirror the device's catalog prefix into the local store and media
/// directory. A failed listing leaves the catalog untouched.
pub async fn ingest(
    db: &SharedDb,
    store: &dyn ObjectStore,
    config: &CatalogConfig,
    media_dir: &Path,
    now: DateTime<Utc>,
) -> Result<IngestReport, CatalogError> {
    let device_id = db.lock().device_id().to_string();
    let listing_prefix = format!("{}/{}/", config.prefix.trim_end_matches('/'), device_id);
    let objects = store.list(&listing_prefix).await?;
    tokio::fs::create_dir_all(media_dir).await?;

    let mut report = IngestReport {
        listed: objects.len(),
        ..IngestReport::default()
    };
    let mut ads = Vec::with_capacity(objects.len());
    for object in &objects {
        let entry = match parse_key(&config.prefix, &device_id, &object.key) {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("Catalog: skipping {}", e);
                report.rejected += 1;
                continue;
            }
        };
        let Some(ad) = entry.to_advertisement(media_dir) else {
            log::warn!("Catalog: skipping {}: unsupported media type", object.key);
            report.rejected += 1;
            continue;
        };
        if fetch_media(store, object, &PathBuf::from(&ad.media_ref), media_dir).await? {
            report.downloaded += 1;
        }
        ads.push(ad);
    }

    let keep: HashSet<String> = ads.iter().map(|ad| ad.id.clone()).collect();
    let deactivated = {
        let db = db.lock();
        db.with_transaction(|db| {
            for ad in &ads {
                db.upsert_advertisement(ad, now)?;
            }
            db.deactivate_missing(&keep, now)
        })?
    };
    report.upserted = ads.len();
    report.deactivated = deactivated;
    log::info!(
        "Catalog: {} objects, {} downloaded, {} active ads, {} deactivated, {} rejected",
        report.listed,
        report.downloaded,
        report.upserted,
        report.deactivated,
        report.rejected
    );
    Ok(report)
}

/// Download an object unless a file of the same size is already in place.
/// Writes go through a temp file in the media directory and are renamed in.
async fn fetch_media(
    store: &dyn ObjectStore,
    object: &ObjectMeta,
    dest: &Path,
    media_dir: &Path,
) -> Result<bool, CatalogError> {
    if let Ok(meta) = tokio::fs::metadata(dest).await {
        if meta.len() == object.size {
            return Ok(false);
        }
    }
    let bytes = store.get(&object.key).await?;
    let mut staged = tempfile::NamedTempFile::new_in(media_dir)?;
    staged.write_all(&bytes)?;
    staged.persist(dest).map_err(|e| CatalogError::Io(e.error))?;
    Ok(true)
}

pub async fn run_catalog_poller(
    db: SharedDb,
    store: Arc<dyn ObjectStore>,
    config: CatalogConfig,
    media_dir: PathBuf,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = Duration::from_secs(config.interval_secs.max(1));

    loop {
        if let Err(e) = ingest(&db, store.as_ref(), &config, &media_dir, Utc::now()).await {
            log::warn!("Catalog poller: ingest failed: {}", e);
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {},
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            },
        }
    }

    log::info!("Catalog poller: stopped");
}
