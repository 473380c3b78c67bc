//! Face embedding math: validation, normalization, distances, refinement and
//! the blob encoding used by the `persons` table.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum EmbeddingError {
    #[error("embedding has {actual} components, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding contains a non-finite component at index {0}")]
    NonFinite(usize),

    #[error("embedding has zero norm")]
    ZeroNorm,

    #[error("invalid embedding blob length: {0}")]
    InvalidBlob(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    Euclidean,
}

impl DistanceMetric {
    /// Distance between two unit vectors. Cosine distance lies in `[0, 2]`,
    /// Euclidean in `[0, 2]` as well once both inputs are normalized.
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceMetric::Cosine => 1.0 - cosine_similarity(a, b),
            DistanceMetric::Euclidean => euclidean_distance(a, b),
        }
    }
}

/// Check dimension and finiteness, then scale to unit length.
pub fn validate_and_normalize(values: &[f32], expected_dim: usize) -> Result<Vec<f32>, EmbeddingError> {
    if values.len() != expected_dim {
        return Err(EmbeddingError::DimensionMismatch {
            expected: expected_dim,
            actual: values.len(),
        });
    }
    if let Some(idx) = values.iter().position(|v| !v.is_finite()) {
        return Err(EmbeddingError::NonFinite(idx));
    }
    normalize(values).ok_or(EmbeddingError::ZeroNorm)
}

pub fn normalize(values: &[f32]) -> Option<Vec<f32>> {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return None;
    }
    Some(values.iter().map(|v| v / norm).collect())
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;

    for (va, vb) in a.iter().zip(b.iter()) {
        dot += va * vb;
        norm_a += va * va;
        norm_b += vb * vb;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt())
}

pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    a.iter()
        .zip(b.iter())
        .map(|(va, vb)| (va - vb) * (va - vb))
        .sum::<f32>()
        .sqrt()
}

/// Exponential moving average of a stored embedding toward a new sample,
/// renormalized. `alpha` is the weight of the new sample.
pub fn refine(stored: &[f32], sample: &[f32], alpha: f32) -> Vec<f32> {
    let alpha = alpha.clamp(0.0, 1.0);
    let blended: Vec<f32> = stored
        .iter()
        .zip(sample.iter())
        .map(|(s, n)| (1.0 - alpha) * s + alpha * n)
        .collect();
    normalize(&blended).unwrap_or_else(|| stored.to_vec())
}

pub fn f32_vec_to_blob(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for value in values {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

pub fn blob_to_f32_vec(blob: &[u8]) -> Result<Vec<f32>, EmbeddingError> {
    if blob.len() % 4 != 0 {
        return Err(EmbeddingError::InvalidBlob(blob.len()));
    }

    let mut values = Vec::with_capacity(blob.len() / 4);
    for chunk in blob.chunks_exact(4) {
        values.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f32_blob_roundtrip() {
        let original = vec![0.1_f32, -0.5_f32, 1.25_f32, 0.0_f32];
        let blob = f32_vec_to_blob(&original);
        let restored = blob_to_f32_vec(&blob).expect("valid blob");
        assert_eq!(original, restored);
        assert_eq!(blob_to_f32_vec(&[0, 1, 2]), Err(EmbeddingError::InvalidBlob(3)));
    }

    #[test]
    fn test_cosine_similarity_ranking() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.9, 0.1, 0.0];
        let c = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
    }

    #[test]
    fn test_validate_rejects_bad_vectors() {
        assert_eq!(
            validate_and_normalize(&[1.0, 0.0], 3),
            Err(EmbeddingError::DimensionMismatch { expected: 3, actual: 2 })
        );
        assert_eq!(
            validate_and_normalize(&[1.0, f32::NAN, 0.0], 3),
            Err(EmbeddingError::NonFinite(1))
        );
        assert_eq!(validate_and_normalize(&[0.0, 0.0, 0.0], 3), Err(EmbeddingError::ZeroNorm));

        let unit = validate_and_normalize(&[3.0, 4.0, 0.0], 3).unwrap();
        assert!((unit[0] - 0.6).abs() < 1e-6);
        assert!((unit[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_metrics_agree_on_identical_vectors() {
        let v = normalize(&[0.2, 0.4, 0.4]).unwrap();
        assert!(DistanceMetric::Cosine.distance(&v, &v).abs() < 1e-6);
        assert!(DistanceMetric::Euclidean.distance(&v, &v).abs() < 1e-6);
        assert_eq!(euclidean_distance(&[1.0], &[1.0, 2.0]), f32::INFINITY);
    }

    #[test]
    fn test_refine_moves_toward_sample_and_stays_unit() {
        let stored = vec![1.0, 0.0];
        let sample = vec![0.0, 1.0];
        let refined = refine(&stored, &sample, 0.25);
        let norm: f32 = refined.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!(refined[0] > refined[1]);
        assert!(refined[1] > 0.0);
    }
}
