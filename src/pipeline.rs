//! Per-frame detection path: faces in, one ad on screen out.
//!
//! The vision and display collaborators live outside this crate. For each
//! frame the pipeline resolves every detected face to a person, records the
//! identification, then selects one ad for the most confidently classified
//! face and reports the display outcome back to the selector.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::DisplayOutcome;
use crate::demographics::{Observation, RawDemographics};
use crate::identity::{IdentityError, IdentityResolver};
use crate::selection::{AdSelector, Selection, SelectionError};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("vision collaborator failed: {0}")]
    Vision(String),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Selection(#[from] SelectionError),
}

/// A captured camera frame. `reference` is what gets stored on
/// identification events (a file name or capture id).
#[derive(Debug, Clone)]
pub struct Frame {
    pub reference: String,
    pub captured_at: DateTime<Utc>,
    pub pixels: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaceDetection {
    pub bbox: BoundingBox,
    pub embedding: Vec<f32>,
}

pub trait VisionCollaborator: Send + Sync {
    fn detect(&self, frame: &Frame) -> Result<Vec<FaceDetection>, String>;
    fn classify(&self, frame: &Frame, detection: &FaceDetection) -> Result<RawDemographics, String>;
}

pub trait DisplayCollaborator: Send + Sync {
    /// Put the media on screen. Returns what actually happened.
    fn display(&self, media_ref: &str, ad_id: &str) -> DisplayOutcome;
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdentifiedFace {
    pub person_id: String,
    pub created: bool,
    pub observation: Observation,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameReport {
    pub detected: usize,
    pub faces: Vec<IdentifiedFace>,
    /// Faces dropped because the classifier or embedding output was invalid.
    pub rejected: usize,
    pub ad_id: Option<String>,
    pub outcome: Option<DisplayOutcome>,
}

pub struct FramePipeline {
    device_id: String,
    resolver: Arc<IdentityResolver>,
    selector: Arc<AdSelector>,
    vision: Box<dyn VisionCollaborator>,
    display: Box<dyn DisplayCollaborator>,
}

impl FramePipeline {
    pub fn new(
        device_id: impl Into<String>,
        resolver: Arc<IdentityResolver>,
        selector: Arc<AdSelector>,
        vision: Box<dyn VisionCollaborator>,
        display: Box<dyn DisplayCollaborator>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            resolver,
            selector,
            vision,
            display,
        }
    }

    pub fn process_frame(&self, frame: &Frame) -> Result<FrameReport, PipelineError> {
        let detections = self.vision.detect(frame).map_err(PipelineError::Vision)?;
        let mut report = FrameReport {
            detected: detections.len(),
            ..FrameReport::default()
        };
        let now = frame.captured_at;

        for detection in &detections {
            let raw = match self.vision.classify(frame, detection) {
                Ok(raw) => raw,
                Err(e) => {
                    log::warn!("Pipeline: classification failed on {}: {}", frame.reference, e);
                    report.rejected += 1;
                    continue;
                }
            };
            let observation = match Observation::from_raw(&raw) {
                Ok(observation) => observation,
                Err(e) => {
                    log::warn!("Pipeline: rejected demographics on {}: {}", frame.reference, e);
                    report.rejected += 1;
                    continue;
                }
            };
            let resolution = match self.resolver.resolve_detailed(&detection.embedding, now) {
                Ok(resolution) => resolution,
                Err(IdentityError::InvalidEmbedding(e)) => {
                    log::warn!("Pipeline: rejected embedding on {}: {}", frame.reference, e);
                    report.rejected += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            self.resolver.record_identification(
                &resolution.person_id,
                &observation,
                Some(frame.reference.as_str()),
                now,
            )?;
            report.faces.push(IdentifiedFace {
                person_id: resolution.person_id,
                created: resolution.created,
                observation,
            });
        }

        // One ad per frame, aimed at the face the classifier is surest about.
        let Some(target) = report
            .faces
            .iter()
            .max_by(|a, b| a.observation.confidence.total_cmp(&b.observation.confidence))
        else {
            return Ok(report);
        };

        let selection = self.selector.select_for_person(
            Some(target.person_id.as_str()),
            &target.observation,
            now,
            &self.device_id,
        )?;
        let chosen = match selection {
            Selection::Selected(chosen) => chosen,
            Selection::NoEligibleAd => return Ok(report),
        };

        let outcome = self.display.display(&chosen.ad.media_ref, &chosen.ad.id);
        if outcome != DisplayOutcome::Shown {
            log::warn!("Pipeline: display of {} reported {}", chosen.ad.id, outcome.as_str());
        }
        self.selector.record_outcome(chosen.display_seq, outcome, Utc::now())?;
        report.ad_id = Some(chosen.ad.id);
        report.outcome = Some(outcome);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::media::fixtures::ad;
    use crate::db::test_utils::test_db;
    use crate::db::SharedDb;
    use crate::selection::draw::ScriptedDraws;
    use crate::types::{IdentityConfig, SelectionConfig};
    use parking_lot::Mutex;

    struct FakeVision {
        faces: Vec<(Vec<f32>, RawDemographics)>,
    }

    impl VisionCollaborator for FakeVision {
        fn detect(&self, _frame: &Frame) -> Result<Vec<FaceDetection>, String> {
            Ok(self
                .faces
                .iter()
                .enumerate()
                .map(|(i, (embedding, _))| FaceDetection {
                    bbox: BoundingBox {
                        x: i as f32 * 10.0,
                        y: 0.0,
                        width: 10.0,
                        height: 10.0,
                    },
                    embedding: embedding.clone(),
                })
                .collect())
        }

        fn classify(&self, _frame: &Frame, detection: &FaceDetection) -> Result<RawDemographics, String> {
            self.faces
                .iter()
                .find(|(embedding, _)| *embedding == detection.embedding)
                .map(|(_, raw)| raw.clone())
                .ok_or_else(|| "unknown face".to_string())
        }
    }

    struct FakeDisplay {
        outcome: DisplayOutcome,
        shown: Arc<Mutex<Vec<String>>>,
    }

    impl DisplayCollaborator for FakeDisplay {
        fn display(&self, media_ref: &str, _ad_id: &str) -> DisplayOutcome {
            self.shown.lock().push(media_ref.to_string());
            self.outcome
        }
    }

    fn raw(age: f64, gender: &str, confidence: f64) -> RawDemographics {
        RawDemographics {
            age: Some(age),
            gender: Some(gender.into()),
            confidence: Some(confidence),
            ..RawDemographics::default()
        }
    }

    fn pipeline(
        db: &SharedDb,
        faces: Vec<(Vec<f32>, RawDemographics)>,
        outcome: DisplayOutcome,
    ) -> (FramePipeline, Arc<Mutex<Vec<String>>>) {
        let identity = IdentityConfig {
            embedding_dim: 2,
            ..IdentityConfig::default()
        };
        let resolver = Arc::new(IdentityResolver::new(db.clone(), identity));
        let selector = Arc::new(AdSelector::new(
            db.clone(),
            SelectionConfig::default(),
            chrono_tz::UTC,
            Box::new(ScriptedDraws::new([0.5])),
        ));
        let shown = Arc::new(Mutex::new(Vec::new()));
        let display = FakeDisplay {
            outcome,
            shown: shown.clone(),
        };
        let pipeline = FramePipeline::new(
            "dev-a",
            resolver,
            selector,
            Box::new(FakeVision { faces }),
            Box::new(display),
        );
        (pipeline, shown)
    }

    fn frame() -> Frame {
        Frame {
            reference: "frame-0001.jpg".into(),
            captured_at: Utc::now(),
            pixels: Vec::new(),
        }
    }

    #[test]
    fn test_frame_identifies_faces_and_shows_one_ad() {
        let db = test_db("dev-a").into_shared();
        db.lock().upsert_advertisement(&ad("ad-1", 1.0), Utc::now()).unwrap();
        let faces = vec![
            (vec![1.0, 0.0], raw(25.0, "male", 0.6)),
            (vec![0.0, 1.0], raw(44.0, "female", 0.9)),
        ];
        let (pipeline, shown) = pipeline(&db, faces, DisplayOutcome::Shown);

        let report = pipeline.process_frame(&frame()).unwrap();
        assert_eq!(report.detected, 2);
        assert_eq!(report.faces.len(), 2);
        assert!(report.faces.iter().all(|f| f.created));
        assert_eq!(report.ad_id.as_deref(), Some("ad-1"));
        assert_eq!(report.outcome, Some(DisplayOutcome::Shown));
        assert_eq!(*shown.lock(), vec!["media/ad-1.mp4".to_string()]);

        let db = db.lock();
        assert_eq!(db.count_persons().unwrap(), 2);
        // The display event is attributed to the most confident face.
        let display = db.get_display_event("dev-a", db.current_seq().unwrap()).unwrap().unwrap();
        assert_eq!(display.person_id.as_ref(), Some(&report.faces[1].person_id));
    }

    #[test]
    fn test_failed_display_appends_correction() {
        let db = test_db("dev-a").into_shared();
        db.lock().upsert_advertisement(&ad("ad-1", 1.0), Utc::now()).unwrap();
        let (pipeline, _) = pipeline(&db, vec![(vec![1.0, 0.0], raw(30.0, "female", 0.8))], DisplayOutcome::Error);

        let report = pipeline.process_frame(&frame()).unwrap();
        assert_eq!(report.outcome, Some(DisplayOutcome::Error));

        let db = db.lock();
        let correction = db.get_display_event("dev-a", db.current_seq().unwrap()).unwrap().unwrap();
        assert_eq!(correction.outcome, DisplayOutcome::Error);
        assert!(correction.corrects_seq.is_some());
    }

    #[test]
    fn test_invalid_faces_are_skipped() {
        let db = test_db("dev-a").into_shared();
        let faces = vec![
            // Wrong dimension.
            (vec![1.0, 0.0, 0.0], raw(30.0, "male", 0.8)),
            // Confidence out of range.
            (vec![0.0, 1.0], raw(30.0, "male", 1.5)),
        ];
        let (pipeline, shown) = pipeline(&db, faces, DisplayOutcome::Shown);

        let report = pipeline.process_frame(&frame()).unwrap();
        assert_eq!(report.detected, 2);
        assert_eq!(report.rejected, 2);
        assert!(report.faces.is_empty());
        assert!(report.ad_id.is_none());
        assert!(shown.lock().is_empty());
        assert_eq!(db.lock().count_persons().unwrap(), 0);
    }

    #[test]
    fn test_empty_catalog_shows_nothing() {
        let db = test_db("dev-a").into_shared();
        let (pipeline, shown) = pipeline(&db, vec![(vec![1.0, 0.0], raw(30.0, "male", 0.8))], DisplayOutcome::Shown);
        let report = pipeline.process_frame(&frame()).unwrap();
        assert_eq!(report.faces.len(), 1);
        assert!(report.ad_id.is_none());
        assert!(shown.lock().is_empty());
    }
}
