//! Cumulative-weight draw and its sources of uniform values.

use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Open01};

/// Source of uniform values in `[0, 1)`.
pub trait UnitSource: Send {
    fn next_unit(&mut self) -> f64;
}

/// Seedable pseudo-random source. The same seed replays the same draws.
pub struct RngDraws {
    rng: StdRng,
}

impl RngDraws {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Seed from the configured value, or a fresh one when none is set.
    pub fn from_config(seed: Option<u64>) -> Self {
        let seed = seed.unwrap_or_else(|| uuid::Uuid::new_v4().as_u64_pair().0);
        Self::seeded(seed)
    }
}

impl UnitSource for RngDraws {
    fn next_unit(&mut self) -> f64 {
        Open01.sample(&mut self.rng)
    }
}

/// Replays a fixed list of values, cycling when exhausted.
pub struct ScriptedDraws {
    values: VecDeque<f64>,
}

impl ScriptedDraws {
    pub fn new(values: impl IntoIterator<Item = f64>) -> Self {
        Self {
            values: values.into_iter().collect(),
        }
    }
}

impl UnitSource for ScriptedDraws {
    fn next_unit(&mut self) -> f64 {
        match self.values.pop_front() {
            Some(value) => {
                self.values.push_back(value);
                value.clamp(0.0, 1.0 - f64::EPSILON)
            }
            None => 0.0,
        }
    }
}

/// First index whose cumulative weight exceeds `u * total`.
///
/// Returns `None` for an empty or all-zero weight vector.
pub fn draw_index(weights: &[f64], u: f64) -> Option<usize> {
    let total: f64 = weights.iter().filter(|w| w.is_finite() && **w > 0.0).sum();
    if total <= 0.0 {
        return None;
    }
    let target = u.clamp(0.0, 1.0) * total;
    let mut cumulative = 0.0;
    let mut last_positive = None;
    for (idx, weight) in weights.iter().enumerate() {
        if !(weight.is_finite() && *weight > 0.0) {
            continue;
        }
        cumulative += weight;
        last_positive = Some(idx);
        if cumulative > target {
            return Some(idx);
        }
    }
    // Rounding can leave the target equal to the total.
    last_positive
}
