//! Identity resolution: map a face embedding to a person.
//!
//! Lookup and creation run inside one `BEGIN IMMEDIATE` transaction while the
//! store lock is held, so two frames carrying the same new face serialize and
//! the second one matches the person the first one created.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::watch;

use crate::db::{DbError, IdentificationEvent, SharedDb};
use crate::demographics::Observation;
use crate::embeddings::{self, EmbeddingError};
use crate::types::IdentityConfig;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(#[from] EmbeddingError),

    #[error(transparent)]
    Store(#[from] DbError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub person_id: String,
    pub created: bool,
    /// Distance to the matched person; `None` when a person was created.
    pub distance: Option<f32>,
}

pub struct IdentityResolver {
    db: SharedDb,
    config: IdentityConfig,
}

impl IdentityResolver {
    pub fn new(db: SharedDb, config: IdentityConfig) -> Self {
        Self { db, config }
    }

    pub fn resolve(&self, embedding: &[f32], now: DateTime<Utc>) -> Result<String, IdentityError> {
        Ok(self.resolve_detailed(embedding, now)?.person_id)
    }

    /// Match against every non-retired person; refine and touch the nearest
    /// one when it lies strictly inside the threshold, otherwise create a new
    /// person.
    pub fn resolve_detailed(&self, embedding: &[f32], now: DateTime<Utc>) -> Result<Resolution, IdentityError> {
        let sample = embeddings::validate_and_normalize(embedding, self.config.embedding_dim)?;
        let metric = self.config.metric;
        let threshold = self.config.threshold;
        let alpha = self.config.refine_alpha;

        let db = self.db.lock();
        db.with_transaction(|db| {
            let nearest = db
                .active_person_embeddings()?
                .into_iter()
                .map(|(id, stored)| {
                    let distance = metric.distance(&sample, &stored);
                    (id, stored, distance)
                })
                .min_by(|a, b| a.2.total_cmp(&b.2));

            match nearest {
                Some((id, stored, distance)) if distance < threshold => {
                    let current = db
                        .get_person(&id)?
                        .ok_or_else(|| DbError::NotFound(format!("person {}", id)))?;
                    let mut payload = current.payload();
                    payload.embedding = embeddings::refine(&stored, &sample, alpha);
                    if now > payload.last_seen {
                        payload.last_seen = now;
                    }
                    db.update_person(&payload, now)?;
                    Ok(Resolution {
                        person_id: id,
                        created: false,
                        distance: Some(distance),
                    })
                }
                _ => {
                    let id = uuid::Uuid::new_v4().to_string();
                    db.create_person(&id, &sample, None, now)?;
                    log::info!("Identity: new person {}", id);
                    Ok(Resolution {
                        person_id: id,
                        created: true,
                        distance: None,
                    })
                }
            }
        })
    }

    /// Append an identification event and fold the observation into the
    /// person's aggregated estimate (kept unless the new confidence is at
    /// least as high). `frame_ref` is attached only when the person has no
    /// frame captured within the throttle window.
    pub fn record_identification(
        &self,
        person_id: &str,
        observation: &Observation,
        frame_ref: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<IdentificationEvent, IdentityError> {
        let throttle = Duration::seconds(self.config.frame_throttle_secs);
        let db = self.db.lock();
        let event = db.with_transaction(|db| {
            let person = db
                .get_person(person_id)?
                .ok_or_else(|| DbError::NotFound(format!("person {}", person_id)))?;

            let frame_due = match person.last_frame_at {
                Some(last) => now - last >= throttle,
                None => true,
            };
            let attached = frame_ref.filter(|_| frame_due);

            let event = db.record_identification_event(person_id, observation, attached, now)?;
            if attached.is_some() {
                db.set_last_frame_at(person_id, now)?;
            }

            let replace = match &person.demographics {
                Some(existing) => observation.confidence >= existing.confidence,
                None => true,
            };
            if replace && person.demographics != Some(observation.estimate()) {
                let mut payload = person.payload();
                payload.demographics = Some(observation.estimate());
                db.update_person(&payload, now)?;
            }
            Ok::<_, DbError>(event)
        })?;
        Ok(event)
    }

    /// Soft-retire persons not seen within the retention window.
    pub fn retire_stale(&self, now: DateTime<Utc>) -> Result<usize, IdentityError> {
        let cutoff = now - Duration::days(self.config.retention_days);
        Ok(self.db.lock().retire_stale_persons(cutoff, now)?)
    }
}

/// Retire stale persons once a day until shutdown.
pub async fn run_retention_poller(resolver: Arc<IdentityResolver>, mut shutdown: watch::Receiver<bool>) {
    let interval = std::time::Duration::from_secs(24 * 60 * 60);

    loop {
        match resolver.retire_stale(Utc::now()) {
            Ok(0) => {}
            Ok(n) => log::info!("Retention poller: retired {} persons", n),
            Err(e) => log::warn!("Retention poller: failed: {}", e),
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

    log::info!("Retention poller: stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;
    use crate::demographics::{AgeBucket, Gender};
    use crate::embeddings::DistanceMetric;
    use std::sync::{Arc, Barrier};

    fn config() -> IdentityConfig {
        IdentityConfig {
            embedding_dim: 4,
            threshold: 0.1,
            ..IdentityConfig::default()
        }
    }

    fn resolver() -> IdentityResolver {
        IdentityResolver::new(test_db("dev-a").into_shared(), config())
    }

    #[test]
    fn test_close_embeddings_resolve_to_same_person() {
        let resolver = resolver();
        let now = Utc::now();
        let first = resolver.resolve_detailed(&[1.0, 0.0, 0.0, 0.0], now).unwrap();
        assert!(first.created);

        for jitter in [0.01_f32, 0.02, -0.015, 0.03] {
            let id = resolver.resolve(&[1.0, jitter, 0.0, jitter / 2.0], now).unwrap();
            assert_eq!(id, first.person_id);
        }
        assert_eq!(resolver.db.lock().count_persons().unwrap(), 1);
    }

    #[test]
    fn test_far_embedding_creates_new_person() {
        let resolver = resolver();
        let now = Utc::now();
        let a = resolver.resolve(&[1.0, 0.0, 0.0, 0.0], now).unwrap();
        let b = resolver.resolve(&[0.0, 1.0, 0.0, 0.0], now).unwrap();
        assert_ne!(a, b);
        assert_eq!(resolver.db.lock().count_persons().unwrap(), 2);
    }

    #[test]
    fn test_match_refines_embedding_and_bumps_version() {
        let resolver = resolver();
        let now = Utc::now();
        let id = resolver.resolve(&[1.0, 0.0, 0.0, 0.0], now).unwrap();
        let before = resolver.db.lock().get_person(&id).unwrap().unwrap();
        let later = now + Duration::seconds(3);
        let result = resolver.resolve_detailed(&[1.0, 0.1, 0.0, 0.0], later).unwrap();
        assert!(!result.created);
        assert!(result.distance.unwrap() < 0.1);

        let after = resolver.db.lock().get_person(&id).unwrap().unwrap();
        assert!(after.embedding[1] > 0.0);
        assert!(after.version.seq > before.version.seq);
        assert_eq!(after.prev_version, Some(before.version));
    }

    #[test]
    fn test_euclidean_metric_threshold() {
        let resolver = IdentityResolver::new(
            test_db("dev-a").into_shared(),
            IdentityConfig {
                metric: DistanceMetric::Euclidean,
                threshold: 0.5,
                ..config()
            },
        );
        let now = Utc::now();
        let a = resolver.resolve(&[1.0, 0.0, 0.0, 0.0], now).unwrap();
        assert_eq!(resolver.resolve(&[1.0, 0.3, 0.0, 0.0], now).unwrap(), a);
        assert_ne!(resolver.resolve(&[1.0, 1.0, 0.0, 0.0], now).unwrap(), a);
    }

    #[test]
    fn test_concurrent_resolution_creates_one_person() {
        let db = test_db("dev-a").into_shared();
        let resolver = Arc::new(IdentityResolver::new(db.clone(), config()));
        let barrier = Arc::new(Barrier::new(8));
        let now = Utc::now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let resolver = resolver.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    resolver.resolve(&[0.0, 0.0, 1.0, 0.0], now).unwrap()
                })
            })
            .collect();
        let ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(ids.iter().all(|id| id == &ids[0]));
        assert_eq!(db.lock().count_persons().unwrap(), 1);
    }

    #[test]
    fn test_invalid_embedding_is_rejected() {
        let resolver = resolver();
        let err = resolver.resolve(&[1.0, 0.0], Utc::now()).unwrap_err();
        assert!(matches!(err, IdentityError::InvalidEmbedding(_)));
    }

    #[test]
    fn test_record_identification_updates_estimate_and_throttles_frames() {
        let resolver = resolver();
        let now = Utc::now();
        let id = resolver.resolve(&[1.0, 0.0, 0.0, 0.0], now).unwrap();

        let confident = Observation::new(AgeBucket::From30To39, Gender::Female, 0.9).unwrap();
        let first = resolver
            .record_identification(&id, &confident, Some("frames/a.jpg"), now)
            .unwrap();
        assert_eq!(first.frame_ref.as_deref(), Some("frames/a.jpg"));

        let unsure = Observation::new(AgeBucket::From40To49, Gender::Male, 0.3).unwrap();
        let second = resolver
            .record_identification(&id, &unsure, Some("frames/b.jpg"), now + Duration::minutes(2))
            .unwrap();
        assert_eq!(second.frame_ref, None);

        let person = resolver.db.lock().get_person(&id).unwrap().unwrap();
        assert_eq!(person.demographics, Some(confident.estimate()));

        let third = resolver
            .record_identification(&id, &unsure, Some("frames/c.jpg"), now + Duration::minutes(11))
            .unwrap();
        assert_eq!(third.frame_ref.as_deref(), Some("frames/c.jpg"));
        assert_eq!(resolver.db.lock().identifications_for_person(&id).unwrap().len(), 3);
    }

    #[test]
    fn test_unknown_person_surfaces_store_error() {
        let resolver = resolver();
        let obs = Observation::new(AgeBucket::Over60, Gender::Male, 0.5).unwrap();
        let err = resolver
            .record_identification("ghost", &obs, None, Utc::now())
            .unwrap_err();
        assert!(matches!(err, IdentityError::Store(DbError::NotFound(_))));
    }
}
