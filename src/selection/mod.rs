//! Audience-aware ad selection.
//!
//! Filters the active catalog by the observed demographics and the local time
//! of day, drops ads still inside the minimum repeat window, weights the rest
//! and draws one. The display event is written before the ad is returned.

pub mod draw;
pub mod weights;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use thiserror::Error;

use crate::db::{Advertisement, DbError, DisplayEvent, DisplayOutcome, KioskDb, SharedDb};
use crate::demographics::Observation;
use crate::types::SelectionConfig;
use draw::{draw_index, UnitSource};
use weights::{ad_weight, catalog_average, stats_by_ad};

/// Half-lives after which a past showing no longer measurably affects weight.
const RECENCY_HORIZON_HALF_LIVES: f64 = 16.0;

#[derive(Debug, Error)]
pub enum SelectionError {
    #[error(transparent)]
    Store(#[from] DbError),

    #[error("selection requested for device {requested} on the store of {store}")]
    ForeignDevice { requested: String, store: String },

    #[error("display event {0} not found")]
    UnknownDisplay(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectedAd {
    pub ad: Advertisement,
    /// Sequence of the display event recorded for this choice. Pass it back
    /// to [`AdSelector::record_outcome`].
    pub display_seq: i64,
    pub weight: f64,
    pub probability: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Selected(SelectedAd),
    /// Nothing matches; the display collaborator falls back to its idle ad.
    NoEligibleAd,
}

pub struct AdSelector {
    db: SharedDb,
    config: SelectionConfig,
    tz: chrono_tz::Tz,
    draws: Mutex<Box<dyn UnitSource>>,
}

impl AdSelector {
    pub fn new(db: SharedDb, config: SelectionConfig, tz: chrono_tz::Tz, draws: Box<dyn UnitSource>) -> Self {
        Self {
            db,
            config,
            tz,
            draws: Mutex::new(draws),
        }
    }

    pub fn select(
        &self,
        observation: &Observation,
        now: DateTime<Utc>,
        device_id: &str,
    ) -> Result<Selection, SelectionError> {
        self.select_for_person(None, observation, now, device_id)
    }

    pub fn select_for_person(
        &self,
        person_id: Option<&str>,
        observation: &Observation,
        now: DateTime<Utc>,
        device_id: &str,
    ) -> Result<Selection, SelectionError> {
        let db = self.db.lock();
        if db.device_id() != device_id {
            return Err(SelectionError::ForeignDevice {
                requested: device_id.to_string(),
                store: db.device_id().to_string(),
            });
        }

        db.with_transaction(|db| {
            let candidates = self.weighted_candidates(db, observation, now)?;
            if candidates.is_empty() {
                log::debug!(
                    "Selection: no eligible ad for {}/{}",
                    observation.age_bucket,
                    observation.gender
                );
                return Ok(Selection::NoEligibleAd);
            }

            let weights: Vec<f64> = candidates.iter().map(|(_, w)| *w).collect();
            let total: f64 = weights.iter().sum();
            let u = self.draws.lock().next_unit();
            let Some(idx) = draw_index(&weights, u) else {
                return Ok(Selection::NoEligibleAd);
            };
            let (ad, weight) = candidates[idx].clone();

            let event = db.record_display_event(
                &ad.id,
                person_id,
                observation,
                now,
                DisplayOutcome::Shown,
                None,
            )?;
            log::info!(
                "Selection: {} (weight {:.3} of {:.3}) for {}/{}",
                ad.id,
                weight,
                total,
                observation.age_bucket,
                observation.gender
            );

            Ok(Selection::Selected(SelectedAd {
                ad,
                display_seq: event.seq,
                weight,
                probability: weight / total,
            }))
        })
    }

    /// Eligible ads with their weights, without drawing or recording.
    pub fn preview(
        &self,
        observation: &Observation,
        now: DateTime<Utc>,
    ) -> Result<Vec<(Advertisement, f64)>, SelectionError> {
        let db = self.db.lock();
        self.weighted_candidates(&db, observation, now)
    }

    /// Report what the display collaborator did with a selection. A `shown`
    /// outcome confirms the recorded event; anything else appends a
    /// correction row so the showing stops counting in later weighting.
    pub fn record_outcome(
        &self,
        display_seq: i64,
        outcome: DisplayOutcome,
        now: DateTime<Utc>,
    ) -> Result<Option<DisplayEvent>, SelectionError> {
        if outcome == DisplayOutcome::Shown {
            return Ok(None);
        }
        let db = self.db.lock();
        let original = db
            .get_display_event(db.device_id(), display_seq)?
            .ok_or(SelectionError::UnknownDisplay(display_seq))?;
        let correction = db.record_display_event(
            &original.ad_id,
            original.person_id.as_deref(),
            &original.observation,
            now,
            outcome,
            Some(original.seq),
        )?;
        log::info!(
            "Selection: display {} of {} reported {}",
            display_seq,
            original.ad_id,
            outcome.as_str()
        );
        Ok(Some(correction))
    }

    fn weighted_candidates(
        &self,
        db: &KioskDb,
        observation: &Observation,
        now: DateTime<Utc>,
    ) -> Result<Vec<(Advertisement, f64)>, SelectionError> {
        let config = &self.config;
        let catalog = db.active_advertisements()?;

        let mut eligible: Vec<Advertisement> = catalog
            .iter()
            .filter(|ad| ad.matches_observation(observation))
            .filter(|ad| ad.time_window.map_or(true, |w| w.contains(now, &self.tz)))
            .cloned()
            .collect();
        if eligible.is_empty() {
            return Ok(Vec::new());
        }

        let horizon_secs = (config.recency_half_life_secs * RECENCY_HORIZON_HALF_LIVES) as i64;
        let lookback = config
            .variety_window_secs
            .max(config.min_repeat_secs)
            .max(horizon_secs);
        let history = db.shown_history(db.device_id(), now - Duration::seconds(lookback))?;
        let stats = stats_by_ad(&history, now - Duration::seconds(config.variety_window_secs));

        if eligible.len() > 1 {
            let min_repeat = Duration::seconds(config.min_repeat_secs);
            eligible.retain(|ad| match stats.get(&ad.id).and_then(|s| s.last_shown) {
                Some(last) => now - last >= min_repeat,
                None => true,
            });
        }

        let avg = catalog_average(&catalog, &stats);
        Ok(eligible
            .into_iter()
            .map(|ad| {
                let weight = ad_weight(&ad, stats.get(&ad.id), avg, observation, now, config);
                (ad, weight)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::draw::{RngDraws, ScriptedDraws};
    use super::*;
    use crate::db::media::fixtures::ad;
    use crate::db::test_utils::test_db;
    use crate::demographics::{AgeBucket, Gender, TimeWindow};
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn obs() -> Observation {
        Observation::new(AgeBucket::From18To29, Gender::Female, 0.8).unwrap()
    }

    fn selector_with(ads: &[Advertisement], config: SelectionConfig, draws: Box<dyn UnitSource>) -> AdSelector {
        let db = test_db("dev-a");
        for entry in ads {
            db.upsert_advertisement(entry, Utc::now()).unwrap();
        }
        AdSelector::new(db.into_shared(), config, chrono_tz::UTC, draws)
    }

    fn selected_id(selection: &Selection) -> &str {
        match selection {
            Selection::Selected(s) => &s.ad.id,
            Selection::NoEligibleAd => panic!("expected a selection"),
        }
    }

    /// Weights reduce to base weights: no recency decay, no variety boost,
    /// no repeat window.
    fn neutral_config() -> SelectionConfig {
        SelectionConfig {
            min_repeat_secs: 0,
            recency_floor: 1.0,
            variety_strength: 0.0,
            ..SelectionConfig::default()
        }
    }

    #[test]
    fn test_no_eligible_ad_when_filters_exclude_everything() {
        let mut male_only = ad("ad-m", 1.0);
        male_only.genders = vec![Gender::Male];
        let mut seniors = ad("ad-s", 1.0);
        seniors.age_buckets = vec![AgeBucket::Over60];
        let selector = selector_with(&[male_only, seniors], neutral_config(), Box::new(ScriptedDraws::new([0.5])));

        let result = selector.select(&obs(), Utc::now(), "dev-a").unwrap();
        assert_eq!(result, Selection::NoEligibleAd);
    }

    #[test]
    fn test_time_window_uses_kiosk_timezone() {
        let mut evening = ad("ad-evening", 1.0);
        evening.time_window = TimeWindow::parse_label("evening").unwrap();
        let db = test_db("dev-a");
        db.upsert_advertisement(&evening, Utc::now()).unwrap();
        let selector = AdSelector::new(
            db.into_shared(),
            neutral_config(),
            chrono_tz::Asia::Tokyo,
            Box::new(ScriptedDraws::new([0.5])),
        );

        // 09:00 UTC is 18:00 in Tokyo.
        let tokyo_evening = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        assert!(matches!(selector.select(&obs(), tokyo_evening, "dev-a").unwrap(), Selection::Selected(_)));
        let tokyo_morning = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        assert_eq!(selector.select(&obs(), tokyo_morning, "dev-a").unwrap(), Selection::NoEligibleAd);
    }

    #[test]
    fn test_selection_records_display_event() {
        let selector = selector_with(&[ad("ad-1", 1.0)], neutral_config(), Box::new(ScriptedDraws::new([0.3])));
        let now = Utc::now();
        let Selection::Selected(chosen) = selector.select_for_person(Some("p1"), &obs(), now, "dev-a").unwrap() else {
            panic!("expected a selection");
        };
        let event = selector.db.lock().get_display_event("dev-a", chosen.display_seq).unwrap().unwrap();
        assert_eq!(event.ad_id, "ad-1");
        assert_eq!(event.person_id.as_deref(), Some("p1"));
        assert_eq!(event.outcome, DisplayOutcome::Shown);
        assert_eq!(chosen.probability, 1.0);
    }

    #[test]
    fn test_rejects_foreign_device() {
        let selector = selector_with(&[ad("ad-1", 1.0)], neutral_config(), Box::new(ScriptedDraws::new([0.3])));
        assert!(matches!(
            selector.select(&obs(), Utc::now(), "dev-b"),
            Err(SelectionError::ForeignDevice { .. })
        ));
    }

    #[test]
    fn test_scripted_draw_picks_by_cumulative_weight() {
        let ads = [ad("ad-1", 1.0), ad("ad-2", 3.0)];
        let selector = selector_with(&ads, neutral_config(), Box::new(ScriptedDraws::new([0.2, 0.3, 0.9])));
        let now = Utc::now();
        let picks: Vec<String> = (0..3)
            .map(|_| selected_id(&selector.select(&obs(), now, "dev-a").unwrap()).to_string())
            .collect();
        assert_eq!(picks, vec!["ad-1", "ad-2", "ad-2"]);
    }

    #[test]
    fn test_seeded_selection_is_reproducible() {
        let ads = [ad("ad-1", 1.0), ad("ad-2", 2.0), ad("ad-3", 1.5)];
        let run = || {
            let selector = selector_with(&ads, SelectionConfig::default(), Box::new(RngDraws::seeded(99)));
            let start = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap();
            (0..20)
                .map(|i| {
                    let now = start + Duration::seconds(90 * i);
                    match selector.select(&obs(), now, "dev-a").unwrap() {
                        Selection::Selected(s) => s.ad.id,
                        Selection::NoEligibleAd => "none".to_string(),
                    }
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_frequencies_converge_to_weights() {
        let ads = [ad("ad-1", 1.0), ad("ad-2", 2.0), ad("ad-3", 3.0)];
        let selector = selector_with(&ads, neutral_config(), Box::new(RngDraws::seeded(7)));
        let now = Utc::now();
        let draws = 3000;
        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..draws {
            let id = selected_id(&selector.select(&obs(), now, "dev-a").unwrap()).to_string();
            *counts.entry(id).or_default() += 1;
        }
        for (id, expected) in [("ad-1", 1.0 / 6.0), ("ad-2", 2.0 / 6.0), ("ad-3", 3.0 / 6.0)] {
            let observed = counts.get(id).copied().unwrap_or(0) as f64 / draws as f64;
            assert!(
                (observed - expected).abs() < 0.04,
                "{} observed {:.3}, expected {:.3}",
                id,
                observed,
                expected
            );
        }
    }

    #[test]
    fn test_min_repeat_window_excludes_recent_ad() {
        let config = SelectionConfig {
            min_repeat_secs: 60,
            ..SelectionConfig::default()
        };
        let ads = [ad("ad-1", 100.0), ad("ad-2", 1.0)];
        // Always draw near the bottom of the range, where ad-1 sits first.
        let selector = selector_with(&ads, config, Box::new(ScriptedDraws::new([0.001])));
        let t0 = Utc::now();

        assert_eq!(selected_id(&selector.select(&obs(), t0, "dev-a").unwrap()), "ad-1");
        assert_eq!(
            selected_id(&selector.select(&obs(), t0 + Duration::seconds(30), "dev-a").unwrap()),
            "ad-2"
        );
        // Both shown within the window: nothing eligible.
        assert_eq!(
            selector.select(&obs(), t0 + Duration::seconds(45), "dev-a").unwrap(),
            Selection::NoEligibleAd
        );
        // Past the window ad-1 is back.
        assert_eq!(
            selected_id(&selector.select(&obs(), t0 + Duration::seconds(61), "dev-a").unwrap()),
            "ad-1"
        );
    }

    #[test]
    fn test_sole_eligible_ad_may_repeat() {
        let selector = selector_with(&[ad("only", 1.0)], SelectionConfig::default(), Box::new(ScriptedDraws::new([0.5])));
        let t0 = Utc::now();
        assert_eq!(selected_id(&selector.select(&obs(), t0, "dev-a").unwrap()), "only");
        assert_eq!(
            selected_id(&selector.select(&obs(), t0 + Duration::seconds(1), "dev-a").unwrap()),
            "only"
        );
    }

    #[test]
    fn test_skipped_outcome_frees_the_ad() {
        let ads = [ad("ad-1", 100.0), ad("ad-2", 1.0)];
        let selector = selector_with(&ads, SelectionConfig::default(), Box::new(ScriptedDraws::new([0.001])));
        let t0 = Utc::now();
        let Selection::Selected(first) = selector.select(&obs(), t0, "dev-a").unwrap() else {
            panic!("expected a selection");
        };
        assert_eq!(first.ad.id, "ad-1");

        assert!(selector.record_outcome(first.display_seq, DisplayOutcome::Shown, t0).unwrap().is_none());
        let correction = selector
            .record_outcome(first.display_seq, DisplayOutcome::Skipped, t0)
            .unwrap()
            .unwrap();
        assert_eq!(correction.corrects_seq, Some(first.display_seq));

        assert_eq!(
            selected_id(&selector.select(&obs(), t0 + Duration::seconds(5), "dev-a").unwrap()),
            "ad-1"
        );
        assert!(matches!(
            selector.record_outcome(9999, DisplayOutcome::Error, t0),
            Err(SelectionError::UnknownDisplay(9999))
        ));
    }
}
