//! Vector similarity: normalization, cosine, L2 and the weighted blend
//! used to score a probe against gallery embeddings.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_COSINE_WEIGHT: f32 = 0.6;
pub const DEFAULT_L2_WEIGHT: f32 = 0.4;

/// Two embeddings of different length were compared.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("dimension mismatch: expected {expected}, got {actual}")]
pub struct DimensionMismatch {
    pub expected: usize,
    pub actual: usize,
}

fn check_dims(a: &[f32], b: &[f32]) -> Result<(), DimensionMismatch> {
    if a.len() != b.len() {
        return Err(DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }
    Ok(())
}

/// Euclidean norm of `v`.
pub fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Scale `v` to unit length. A zero vector is returned unchanged.
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let n = norm(v);
    if n == 0.0 {
        return v.to_vec();
    }
    v.iter().map(|x| x / n).collect()
}

/// Cosine similarity in [-1, 1]. Returns 0 when either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32, DimensionMismatch> {
    check_dims(a, b)?;

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    Ok(if denom > 0.0 { dot / denom } else { 0.0 })
}

/// Euclidean distance between `a` and `b`.
pub fn l2_distance(a: &[f32], b: &[f32]) -> Result<f32, DimensionMismatch> {
    check_dims(a, b)?;
    Ok(a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt())
}

/// Weighted blend of cosine similarity and inverted L2 distance over
/// unit-normalized inputs.
///
/// `score = w_cos * cos(â, b̂) + w_l2 * (1 - ‖â - b̂‖)`. Identical non-zero
/// inputs score `w_cos + w_l2`, i.e. 1.0 with the default weights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scorer {
    pub cosine_weight: f32,
    pub l2_weight: f32,
}

impl Default for Scorer {
    fn default() -> Self {
        Self {
            cosine_weight: DEFAULT_COSINE_WEIGHT,
            l2_weight: DEFAULT_L2_WEIGHT,
        }
    }
}

impl Scorer {
    pub fn new(cosine_weight: f32, l2_weight: f32) -> Self {
        Self {
            cosine_weight,
            l2_weight,
        }
    }

    /// Combined similarity of two raw embeddings.
    pub fn combined_similarity(&self, a: &[f32], b: &[f32]) -> Result<f32, DimensionMismatch> {
        check_dims(a, b)?;
        self.combined_unit(&normalize(a), &normalize(b))
    }

    /// Combined similarity of two already-normalized embeddings.
    ///
    /// The matcher normalizes the probe once and calls this per record.
    pub fn combined_unit(&self, a: &[f32], b: &[f32]) -> Result<f32, DimensionMismatch> {
        let cos = cosine_similarity(a, b)?;
        let dist = l2_distance(a, b)?;
        Ok(self.cosine_weight * cos + self.l2_weight * (1.0 - dist))
    }
}
