//! Ad weighting.
//!
//! `weight = base_profit_weight * recency_penalty * variety_bonus * mood_affinity`,
//! clamped below by the configured floor so every eligible ad keeps a
//! non-zero chance.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::db::Advertisement;
use crate::demographics::Observation;
use crate::types::SelectionConfig;

/// Per-ad display history on one device.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AdStats {
    pub last_shown: Option<DateTime<Utc>>,
    /// Showings inside the trailing variety window.
    pub recent_count: u32,
}

/// Fold a seq-ordered showing history into per-ad stats.
pub fn stats_by_ad(history: &[(String, DateTime<Utc>)], window_start: DateTime<Utc>) -> HashMap<String, AdStats> {
    let mut stats: HashMap<String, AdStats> = HashMap::new();
    for (ad_id, shown_at) in history {
        let entry = stats.entry(ad_id.clone()).or_default();
        // Later rows win: history is in local sequence order.
        entry.last_shown = Some(*shown_at);
        if *shown_at >= window_start {
            entry.recent_count += 1;
        }
    }
    stats
}

/// `1` for an ad never shown; otherwise climbs from `floor` back toward `1`
/// with the given half-life.
pub fn recency_penalty(elapsed_secs: Option<f64>, floor: f64, half_life_secs: f64) -> f64 {
    match elapsed_secs {
        None => 1.0,
        Some(elapsed) => {
            let elapsed = elapsed.max(0.0);
            1.0 - (1.0 - floor) * 2f64.powf(-elapsed / half_life_secs)
        }
    }
}

/// Boost for ads shown less often than the catalog average, capped.
pub fn variety_bonus(count: f64, catalog_avg: f64, strength: f64, cap: f64) -> f64 {
    let deficit = ((catalog_avg - count) / catalog_avg.max(1.0)).max(0.0);
    (1.0 + strength * deficit).min(cap)
}

pub fn mood_affinity(ad: &Advertisement, observation: &Observation, bonus: f64) -> f64 {
    match (&ad.mood_target, &observation.mood) {
        (Some(target), Some(mood)) if target.eq_ignore_ascii_case(mood) => bonus,
        _ => 1.0,
    }
}

/// Mean recent display count over the whole active catalog.
pub fn catalog_average(catalog: &[Advertisement], stats: &HashMap<String, AdStats>) -> f64 {
    if catalog.is_empty() {
        return 0.0;
    }
    let total: u32 = catalog
        .iter()
        .map(|ad| stats.get(&ad.id).map(|s| s.recent_count).unwrap_or(0))
        .sum();
    total as f64 / catalog.len() as f64
}

pub fn ad_weight(
    ad: &Advertisement,
    stats: Option<&AdStats>,
    catalog_avg: f64,
    observation: &Observation,
    now: DateTime<Utc>,
    config: &SelectionConfig,
) -> f64 {
    let elapsed = stats
        .and_then(|s| s.last_shown)
        .map(|last| (now - last).num_milliseconds() as f64 / 1000.0);
    let count = stats.map(|s| s.recent_count).unwrap_or(0) as f64;

    let weight = ad.base_weight
        * recency_penalty(elapsed, config.recency_floor, config.recency_half_life_secs)
        * variety_bonus(count, catalog_avg, config.variety_strength, config.max_variety_bonus)
        * mood_affinity(ad, observation, config.mood_bonus);

    if weight.is_finite() {
        weight.max(config.weight_floor)
    } else {
        config.weight_floor
    }
}
